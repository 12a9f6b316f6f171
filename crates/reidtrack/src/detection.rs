use crate::{BoundingBox, Error, Result};
use ndarray::*;
use uuid::Uuid;

/// Detection represents a bounding box detection in a single image.
///
/// Detections are produced by an external detector and are never mutated by the tracker
/// except to attach an appearance vector computed from the frame.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Unique detection identifier
    id: Uuid,
    /// Bounding box in top, left, width, height format.
    bbox: BoundingBox,
    /// Detection confidence score.
    confidence: f32,
    /// Optional class identifier.
    class_id: Option<usize>,
    /// A feature vector that describes the object contained in this image.
    feature: Option<Array1<f32>>,
}

impl PartialEq for Detection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Detection {
    /// Returns a new Detection
    ///
    /// # Parameters
    ///
    /// * `id`: An optional identifier, one is generated if not supplied.
    /// * `bbox`: A bounding box object.
    /// * `confidence`: Detection confidence score.
    /// * `class_id`: An optional class identifier.
    /// * `feature`: A feature vector that describes the object contained in this image.
    pub fn new(
        id: Option<Uuid>,
        bbox: BoundingBox,
        confidence: f32,
        class_id: Option<usize>,
        feature: Option<Vec<f32>>,
    ) -> Detection {
        Detection {
            id: id.unwrap_or_else(Uuid::new_v4),
            bbox,
            confidence,
            class_id,
            feature: feature.map(Array1::from_vec),
        }
    }

    /// Returns a new Detection from corner co-ordinates `(x1, y1, x2, y2)`.
    pub fn from_tlbr(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Detection {
        Detection::new(
            None,
            BoundingBox::from_tlbr(x1, y1, x2, y2),
            confidence,
            None,
            None,
        )
    }

    /// Returns the unique id of the detection
    pub fn id(&self) -> &Uuid {
        &self.id
    }

    /// Returns a BoundingBox of the detection co-ordinates
    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    /// Returns the confidence of the detection
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Returns the class identifier of the detection
    pub fn class_id(&self) -> Option<usize> {
        self.class_id
    }

    /// Returns the feature array of the detection
    pub fn feature(&self) -> Option<&Array1<f32>> {
        self.feature.as_ref()
    }

    /// Returns the feature array of the detection
    pub fn feature_mut(&mut self) -> &mut Option<Array1<f32>> {
        &mut self.feature
    }

    /// Check that the detection can take part in association.
    ///
    /// Rejects boxes with non-positive or non-finite extents and confidences outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if !self.bbox.is_valid() {
            return Err(Error::MalformedDetection(format!(
                "invalid box x={} y={} w={} h={}",
                self.bbox.x(),
                self.bbox.y(),
                self.bbox.width(),
                self.bbox.height()
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::MalformedDetection(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn validate() {
        assert!(Detection::from_tlbr(0.0, 0.0, 10.0, 10.0, 0.5)
            .validate()
            .is_ok());
        assert!(Detection::from_tlbr(0.0, 0.0, 0.0, 10.0, 0.5)
            .validate()
            .is_err());
        assert!(Detection::from_tlbr(0.0, 0.0, 10.0, 10.0, 1.5)
            .validate()
            .is_err());
        assert!(Detection::from_tlbr(0.0, 0.0, 10.0, 10.0, -0.1)
            .validate()
            .is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = Detection::from_tlbr(0.0, 0.0, 10.0, 10.0, 0.5);
        let b = Detection::from_tlbr(0.0, 0.0, 10.0, 10.0, 0.5);
        assert_ne!(a.id(), b.id());
    }
}
