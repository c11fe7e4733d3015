//! Intensity-histogram face descriptor.
//!
//! The primary face is cropped, resized to 128×128, converted to gray and
//! summarized as a 256-bin intensity histogram scaled to unit L2 norm. This
//! is a tone/lighting signature of the crop, not a learned embedding.

use crate::detector::{primary_face, to_luma};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

pub const DESCRIPTOR_LEN: usize = 256;
/// Side of the square the face crop is resized to.
pub const FACE_SIZE: u32 = 128;
const NORM_EPSILON: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("face box has zero area")]
    EmptyRegion,
    #[error("face box {face:?} exceeds the {width}x{height} image")]
    OutOfBounds {
        face: BoundingBox,
        width: u32,
        height: u32,
    },
}

/// Normalized histogram descriptor (256 values, L2 norm ≈ 1).
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    /// Scale raw bin counts by `1 / (norm + 1e-6)`.
    pub fn from_histogram(histogram: &[u32; DESCRIPTOR_LEN]) -> Self {
        let norm = histogram
            .iter()
            .map(|&c| (c as f64) * (c as f64))
            .sum::<f64>()
            .sqrt();
        let scale = 1.0 / (norm + NORM_EPSILON);
        Self {
            values: histogram.iter().map(|&c| (c as f64 * scale) as f32).collect(),
        }
    }

    /// Wrap precomputed values without renormalizing.
    pub fn from_values(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

/// Describe the primary face, or `None` when there is no usable face.
pub fn extract_descriptor(image: &RgbImage, faces: &[BoundingBox]) -> Option<Descriptor> {
    let face = primary_face(faces)?;
    match describe_face(image, face) {
        Ok(descriptor) => Some(descriptor),
        Err(err) => {
            tracing::debug!(error = %err, "descriptor extraction failed");
            None
        }
    }
}

/// Crop `face`, resize to [`FACE_SIZE`]², gray it and histogram the result.
pub fn describe_face(image: &RgbImage, face: &BoundingBox) -> Result<Descriptor, DescriptorError> {
    if face.width == 0 || face.height == 0 {
        return Err(DescriptorError::EmptyRegion);
    }
    let fits = face.x.checked_add(face.width).is_some_and(|r| r <= image.width())
        && face.y.checked_add(face.height).is_some_and(|b| b <= image.height());
    if !fits {
        return Err(DescriptorError::OutOfBounds {
            face: *face,
            width: image.width(),
            height: image.height(),
        });
    }

    let crop = imageops::crop_imm(image, face.x, face.y, face.width, face.height).to_image();
    // Triangle filtering widens with the scale ratio, so downscaling averages
    // over the source area.
    let resized = imageops::resize(&crop, FACE_SIZE, FACE_SIZE, FilterType::Triangle);
    let gray = to_luma(&resized);

    let mut histogram = [0u32; DESCRIPTOR_LEN];
    for pixel in gray.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }

    Ok(Descriptor::from_histogram(&histogram))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn bbox(x: u32, y: u32, w: u32, h: u32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, neighbors: 6 }
    }

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = ((x + y) % 256) as u8;
            Rgb([v, v / 2, 255 - v])
        })
    }

    #[test]
    fn test_no_faces_is_sentinel() {
        assert!(extract_descriptor(&gradient(64, 64), &[]).is_none());
    }

    #[test]
    fn test_descriptor_is_unit_norm() {
        let d = extract_descriptor(&gradient(300, 200), &[bbox(20, 30, 150, 120)]).unwrap();
        assert_eq!(d.values().len(), DESCRIPTOR_LEN);
        assert!((d.norm() - 1.0).abs() < 1e-5, "norm = {}", d.norm());
        assert!(d.values().iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_flat_crop_concentrates_in_one_bin() {
        let img = RgbImage::from_pixel(100, 100, Rgb([90, 90, 90]));
        let d = describe_face(&img, &bbox(10, 10, 50, 50)).unwrap();
        let nonzero: Vec<usize> = d
            .values()
            .iter()
            .enumerate()
            .filter(|(_, &v)| v > 0.0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(nonzero, vec![90]);
        assert!((d.values()[90] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_uses_largest_face() {
        let mut img = RgbImage::from_pixel(200, 100, Rgb([10, 10, 10]));
        for y in 0..100 {
            for x in 100..200 {
                img.put_pixel(x, y, Rgb([240, 240, 240]));
            }
        }
        let small_dark = bbox(0, 0, 40, 40);
        let large_bright = bbox(110, 10, 80, 80);
        let d = extract_descriptor(&img, &[small_dark, large_bright]).unwrap();
        assert!(d.values()[240] > 0.99);
        assert_eq!(d.values()[10], 0.0);
    }

    #[test]
    fn test_out_of_bounds_box() {
        let img = gradient(50, 50);
        assert!(matches!(
            describe_face(&img, &bbox(40, 40, 20, 20)),
            Err(DescriptorError::OutOfBounds { .. })
        ));
        assert!(extract_descriptor(&img, &[bbox(40, 40, 20, 20)]).is_none());
    }

    #[test]
    fn test_zero_area_box() {
        assert!(matches!(
            describe_face(&gradient(50, 50), &bbox(10, 10, 0, 5)),
            Err(DescriptorError::EmptyRegion)
        ));
    }

    #[test]
    fn test_histogram_normalization_epsilon() {
        let mut hist = [0u32; DESCRIPTOR_LEN];
        hist[0] = 3;
        hist[1] = 4;
        let d = Descriptor::from_histogram(&hist);
        assert!((d.values()[0] - 0.6).abs() < 1e-6);
        assert!((d.values()[1] - 0.8).abs() < 1e-6);
    }
}
