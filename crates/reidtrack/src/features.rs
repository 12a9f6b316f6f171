use crate::BoundingBox;
use anyhow::{bail, Result};
use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use ndarray::*;
use rayon::prelude::*;
use tracing::warn;

/// Crops smaller than this area (in pixels) are penalised by `quality_score`.
pub const MIN_QUALITY_AREA: f32 = 32.0 * 32.0;

const LAPLACIAN: [f32; 9] = [0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0];

/// Turns an image crop into an appearance vector.
///
/// Implementations only look at the pixels of the crop they are given. The output does not need to be normalised,
/// `AppearanceEncoder` takes care of that.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, crop: &RgbImage) -> Result<Vec<f32>>;

    fn name(&self) -> &str;
}

/// Histogram of oriented gradients over a fixed grid of cells.
///
/// The crop is resized to `width x height` greyscale, Sobel gradients are binned by unsigned orientation
/// (`bins` bins over 0..180 degrees) weighted by magnitude, one histogram per `cell_size` square cell.
#[derive(Debug, Clone)]
pub struct HogDescriptor {
    width: u32,
    height: u32,
    cell_size: u32,
    bins: usize,
}

impl Default for HogDescriptor {
    fn default() -> Self {
        HogDescriptor {
            width: 64,
            height: 128,
            cell_size: 16,
            bins: 9,
        }
    }
}

impl HogDescriptor {
    /// Returns the length of the descriptor
    pub fn len(&self) -> usize {
        self.cells_x() * self.cells_y() * self.bins
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cells_x(&self) -> usize {
        (self.width / self.cell_size) as usize
    }

    fn cells_y(&self) -> usize {
        (self.height / self.cell_size) as usize
    }
}

impl FeatureExtractor for HogDescriptor {
    fn extract(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        if crop.width() == 0 || crop.height() == 0 {
            bail!("empty crop");
        }

        let gray = imageops::grayscale(crop);
        let gray = imageops::resize(
            &gray,
            self.width,
            self.height,
            imageops::FilterType::Triangle,
        );
        let gx = horizontal_sobel(&gray);
        let gy = vertical_sobel(&gray);

        let bin_width = 180.0 / self.bins as f32;
        let cells_x = self.cells_x();
        let mut histogram = vec![0.0f32; self.len()];

        for y in 0..self.height {
            for x in 0..self.width {
                let dx = gx.get_pixel(x, y)[0] as f32;
                let dy = gy.get_pixel(x, y)[0] as f32;
                let magnitude = dx.hypot(dy);
                if magnitude == 0.0 {
                    continue;
                }

                let mut angle = dy.atan2(dx).to_degrees();
                if angle < 0.0 {
                    angle += 180.0;
                }
                if angle >= 180.0 {
                    angle -= 180.0;
                }
                let bin = ((angle / bin_width) as usize).min(self.bins - 1);
                let cell = (y / self.cell_size) as usize * cells_x + (x / self.cell_size) as usize;
                histogram[cell * self.bins + bin] += magnitude;
            }
        }

        Ok(histogram)
    }

    fn name(&self) -> &str {
        "hog"
    }
}

/// Mean colour and per channel histograms of a crop.
///
/// Used when a crop has no gradients at all. The leading constant keeps the descriptor non-zero even for a
/// black crop, so every non-empty crop has an appearance.
#[derive(Debug, Clone)]
pub struct ColourDescriptor {
    bins: usize,
}

impl Default for ColourDescriptor {
    fn default() -> Self {
        ColourDescriptor { bins: 8 }
    }
}

impl ColourDescriptor {
    /// Returns the length of the descriptor
    pub fn len(&self) -> usize {
        4 + 3 * self.bins
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl FeatureExtractor for ColourDescriptor {
    fn extract(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        let n = (crop.width() * crop.height()) as f32;
        if n == 0.0 {
            bail!("empty crop");
        }

        let mut mean = [0.0f32; 3];
        let mut histogram = vec![0.0f32; 3 * self.bins];
        for pixel in crop.pixels() {
            for c in 0..3 {
                let value = pixel[c] as usize;
                mean[c] += value as f32 / 255.0;
                histogram[c * self.bins + value * self.bins / 256] += 1.0;
            }
        }

        let mut descriptor = Vec::with_capacity(self.len());
        descriptor.push(1.0);
        descriptor.extend(mean.iter().map(|sum| sum / n));
        descriptor.extend(histogram.iter().map(|count| count / n));
        Ok(descriptor)
    }

    fn name(&self) -> &str {
        "colour"
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxExtractor;

#[cfg(feature = "onnx")]
mod onnx {
    use super::FeatureExtractor;
    use anyhow::{anyhow, Result};
    use image::{imageops, RgbImage};
    use std::path::Path;
    use tract_onnx::prelude::*;

    const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
    const STD: [f32; 3] = [0.229, 0.224, 0.225];

    /// A learned re-identification model run with tract.
    ///
    /// The crop is resized to the model input, scaled to `[0, 1]` and normalised with ImageNet mean and std.
    pub struct OnnxExtractor {
        model: TypedRunnableModel<TypedModel>,
        width: u32,
        height: u32,
    }

    impl OnnxExtractor {
        /// Load a model taking a `1x3xheightxwidth` input.
        pub fn from_path<P: AsRef<Path>>(path: P, width: u32, height: u32) -> Result<Self> {
            let model = tract_onnx::onnx()
                .model_for_path(path)?
                .with_output_fact(0, Default::default())?
                .into_optimized()?
                .into_runnable()?;

            Ok(OnnxExtractor {
                model,
                width,
                height,
            })
        }
    }

    impl FeatureExtractor for OnnxExtractor {
        fn extract(&self, crop: &RgbImage) -> Result<Vec<f32>> {
            let resized = imageops::resize(
                crop,
                self.width,
                self.height,
                imageops::FilterType::Triangle,
            );

            let tensor: Tensor = tract_ndarray::Array4::from_shape_fn(
                (1, 3, self.height as usize, self.width as usize),
                |(_, c, y, x)| {
                    (resized[(x as _, y as _)][c] as f32 / 255.0 - MEAN[c]) / STD[c]
                },
            )
            .into();

            let outputs = self.model.run(tvec!(tensor.into()))?;
            let output = outputs
                .first()
                .ok_or_else(|| anyhow!("model produced no output"))?;

            Ok(output.to_array_view::<f32>()?.iter().copied().collect())
        }

        fn name(&self) -> &str {
            "onnx"
        }
    }
}

/// Pad with zeros or truncate `values` to `dimension`, then L2 normalise. A zero vector stays zero.
///
/// Callers needing a usable appearance check the result with `is_unit`.
pub fn fit_dimension(values: &[f32], dimension: usize) -> Array1<f32> {
    let mut vector = Array1::<f32>::zeros(dimension);
    values
        .iter()
        .zip(vector.iter_mut())
        .for_each(|(value, slot)| *slot = *value);

    let norm = vector.dot(&vector).sqrt();
    if norm > 0.0 && norm.is_finite() {
        vector.mapv_inplace(|v| v / norm);
    } else if !norm.is_finite() {
        vector.fill(0.0);
    }
    vector
}

/// Returns true if `vector` has unit length.
pub fn is_unit(vector: &Array1<f32>) -> bool {
    (vector.dot(vector) - 1.0).abs() < 1e-3
}

/// Produces fixed length unit appearance vectors.
///
/// The learned extractor is tried first. A failure or a degenerate output falls back to the HOG descriptor, and a
/// crop without gradients falls back to its colour. The output is always unit length.
pub struct AppearanceEncoder {
    extractor: Option<Box<dyn FeatureExtractor>>,
    fallback: HogDescriptor,
    colour: ColourDescriptor,
    dimension: usize,
}

impl std::fmt::Debug for AppearanceEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppearanceEncoder")
            .field(
                "extractor",
                &self.extractor.as_ref().map(|extractor| extractor.name()),
            )
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl AppearanceEncoder {
    /// Returns a new AppearanceEncoder without a learned extractor.
    pub fn new(dimension: usize) -> Self {
        AppearanceEncoder {
            extractor: None,
            fallback: HogDescriptor::default(),
            colour: ColourDescriptor::default(),
            dimension,
        }
    }

    /// Set the learned extractor
    pub fn with_extractor(mut self, extractor: Box<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn has_extractor(&self) -> bool {
        self.extractor.is_some()
    }

    /// Encode one crop.
    pub fn encode(&self, crop: &RgbImage) -> Result<Array1<f32>> {
        if let Some(extractor) = &self.extractor {
            match extractor.extract(crop) {
                Ok(values) => {
                    let vector = fit_dimension(&values, self.dimension);
                    if is_unit(&vector) {
                        return Ok(vector);
                    }
                    warn!(
                        extractor = extractor.name(),
                        "degenerate feature vector, using fallback descriptor"
                    );
                }
                Err(err) => warn!(
                    extractor = extractor.name(),
                    "feature extraction failed, using fallback descriptor: {}", err
                ),
            }
        }

        let vector = fit_dimension(&self.fallback.extract(crop)?, self.dimension);
        if is_unit(&vector) {
            return Ok(vector);
        }

        // textureless crop
        let vector = fit_dimension(&self.colour.extract(crop)?, self.dimension);
        if !is_unit(&vector) {
            bail!("no appearance in {}x{} crop", crop.width(), crop.height());
        }
        Ok(vector)
    }

    /// Encode many crops on the rayon pool. Results are in input order.
    pub fn encode_batch(&self, crops: &[RgbImage]) -> Vec<Result<Array1<f32>>> {
        crops.par_iter().map(|crop| self.encode(crop)).collect()
    }
}

/// Copy the part of `frame` covered by `bbox`, clamped to the frame. Returns None if nothing is left.
pub fn crop(frame: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    if !bbox.is_valid() {
        return None;
    }

    let x0 = bbox.x().max(0.0).floor();
    let y0 = bbox.y().max(0.0).floor();
    let x1 = (bbox.x() + bbox.width()).min(frame.width() as f32).ceil();
    let y1 = (bbox.y() + bbox.height()).min(frame.height() as f32).ceil();
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some(
        imageops::crop_imm(
            frame,
            x0 as u32,
            y0 as u32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        )
        .to_image(),
    )
}

/// A cheap quality proxy in `[0, 1)`.
///
/// Sharpness is the variance of a 3x3 Laplacian response squashed as `v / (v + 100)`, multiplied by
/// `min(1, area / MIN_QUALITY_AREA)`.
pub fn quality_score(crop: &RgbImage) -> f32 {
    if crop.width() < 3 || crop.height() < 3 {
        return 0.0;
    }

    let gray: GrayImage = imageops::grayscale(crop);
    let response = imageproc::filter::filter3x3::<Luma<u8>, f32, f32>(&gray, &LAPLACIAN);

    let n = (response.width() * response.height()) as f64;
    let (sum, sum_sq) = response
        .pixels()
        .fold((0.0f64, 0.0f64), |(sum, sum_sq), pixel| {
            let v = pixel[0] as f64;
            (sum + v, sum_sq + v * v)
        });
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0) as f32;

    let sharpness = variance / (variance + 100.0);
    let area = (crop.width() * crop.height()) as f32;
    sharpness * (area / MIN_QUALITY_AREA).min(1.0)
}
