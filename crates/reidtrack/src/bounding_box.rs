use ndarray::*;
use serde::{Deserialize, Serialize};

/// BoundingBox represents an axis-aligned box in image space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left of the bounding box (i.e. min-x)
    x: f32,
    /// Top of the bounding box (i.e. min-y)
    y: f32,
    /// Width of the bounding box
    width: f32,
    /// Height of the bounding box
    height: f32,
}

impl BoundingBox {
    /// Returns a new BoundingBox
    ///
    /// # Parameters
    ///
    /// * `x`: Bounding box left.
    /// * `y`: Bounding box top.
    /// * `width`: Bounding box width.
    /// * `height`: Bounding box height.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width,
            height,
        }
    }

    /// Returns a new BoundingBox from corner co-ordinates `(x1, y1, x2, y2)`.
    pub fn from_tlbr(x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox::new(x1, y1, x2 - x1, y2 - y1)
    }

    /// Returns a new BoundingBox from center x, center y, aspect ratio (`width / height`) and height.
    pub fn from_xyah(cx: f32, cy: f32, aspect_ratio: f32, height: f32) -> BoundingBox {
        let width = aspect_ratio * height;
        BoundingBox::new(cx - width / 2.0, cy - height / 2.0, width, height)
    }

    /// Returns the x of the bounding box
    pub fn x(&self) -> f32 {
        self.x
    }

    /// Returns the y of the bounding box
    pub fn y(&self) -> f32 {
        self.y
    }

    /// Returns the width of the bounding box
    pub fn width(&self) -> f32 {
        self.width
    }

    /// Returns the height of the bounding box
    pub fn height(&self) -> f32 {
        self.height
    }

    /// Returns the area of the bounding box
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Returns the center point `(x, y)` of the bounding box
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Returns true if every co-ordinate is finite and both sides are strictly positive.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.width > 0.0
            && self.height > 0.0
    }

    /// Intersection over union with another box, in `[0.0, 1.0]`.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Returns the bounding box in left, top, width, height format, i.e., `(min x, min y, width, height)`.
    pub fn to_tlwh(&self) -> Array1<f32> {
        arr1::<f32>(&[self.x, self.y, self.width, self.height])
    }

    /// Returns the bounding box in top-left, bottom-right format, i.e., `(min x, min y, max x, max y)`.
    pub fn to_tlbr(&self) -> Array1<f32> {
        arr1::<f32>(&[self.x, self.y, self.x + self.width, self.y + self.height])
    }

    /// Returns the bounding box in center x, center y, aspect ratio, height format, where the aspect ratio is `width / height`.
    pub fn to_xyah(&self) -> Array1<f32> {
        arr1::<f32>(&[
            self.x + (self.width / 2.0),
            self.y + (self.height / 2.0),
            self.width / self.height,
            self.height,
        ])
    }
}
