//! Multi-scale Haar cascade face detector.
//!
//! Scans a grayscale copy of the image with the cascade's base window over a
//! pyramid of downscaled images, then groups the raw hits. Scan parameters
//! are fixed so detections are reproducible across deployments.

use crate::cascade::{CascadeError, HaarCascade, IntegralImage, Verdict, MAX_INTEGRAL_PIXELS};
use crate::grouping::{group_rectangles, Group, Rect};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use std::borrow::Cow;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

// --- Fixed scan parameters ---
pub const SCALE_FACTOR: f64 = 1.1;
pub const MIN_NEIGHBORS: u32 = 5;
pub const MIN_FACE_SIZE: (u32, u32) = (30, 30);
const GROUP_EPS: f64 = 0.2;

/// Pluggable face detection backend.
///
/// Implementations are shared read-only across comparison workers and must
/// never fail outward: internal faults are reported as "no faces".
pub trait FaceDetector: Send + Sync {
    /// Detect faces in an RGB image, returning zero or more boxes.
    fn detect(&self, image: &RgbImage) -> Vec<BoundingBox>;

    /// Like [`detect`](Self::detect), but gives up once `deadline` passes,
    /// returning `None`. The default runs `detect` to completion.
    fn detect_until(&self, image: &RgbImage, _deadline: Instant) -> Option<Vec<BoundingBox>> {
        Some(self.detect(image))
    }
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("degenerate input: {width}x{height} image")]
    DegenerateInput { width: u32, height: u32 },
    #[error("scan abandoned at deadline")]
    DeadlineExceeded,
}

/// Haar cascade detector with the fixed scan parameters.
#[derive(Debug)]
pub struct CascadeDetector {
    cascade: HaarCascade,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade) -> Self {
        Self { cascade }
    }

    /// Load the cascade XML at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        HaarCascade::load(path).map(Self::new)
    }

    pub fn cascade(&self) -> &HaarCascade {
        &self.cascade
    }

    /// Detect faces in a grayscale image.
    pub fn detect_gray(&self, gray: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        self.detect_gray_until(gray, None)
    }

    /// Detect faces in a grayscale image, abandoning the scan with
    /// [`DetectorError::DeadlineExceeded`] once `deadline` passes.
    ///
    /// The deadline is checked before each scale and each window row.
    pub fn detect_gray_until(
        &self,
        gray: &GrayImage,
        deadline: Option<Instant>,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (img_w, img_h) = gray.dimensions();
        let hits = self.scan(gray, deadline)?;
        let groups = group_rectangles(&hits, MIN_NEIGHBORS, GROUP_EPS);
        tracing::trace!(raw_hits = hits.len(), groups = groups.len(), "cascade scan finished");

        Ok(groups
            .iter()
            .filter_map(|g| clamp_to_image(g, img_w, img_h))
            .collect())
    }

    /// Raw window hits in image coordinates, before grouping.
    ///
    /// For factor = 1, 1.1, 1.21, ... the image is resized by 1/factor and the
    /// base window visits every `scaled - window + 1` position per axis (step
    /// 2, or 1 from factor 2 on). Scales whose window is below
    /// [`MIN_FACE_SIZE`] are skipped; the scan stops once the resized image is
    /// smaller than the base window or the window outgrows the image.
    fn scan(&self, gray: &GrayImage, deadline: Option<Instant>) -> Result<Vec<Rect>, DetectorError> {
        let (img_w, img_h) = gray.dimensions();
        let (base_w, base_h) = self.cascade.window_size();
        if img_w == 0 || img_h == 0 {
            return Err(DetectorError::DegenerateInput {
                width: img_w,
                height: img_h,
            });
        }
        let expired = || deadline.is_some_and(|d| Instant::now() >= d);

        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            if expired() {
                return Err(DetectorError::DeadlineExceeded);
            }
            let win_w = (base_w as f64 * factor).round() as u32;
            let win_h = (base_h as f64 * factor).round() as u32;
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;

            if scaled_w < base_w || scaled_h < base_h || win_w > img_w || win_h > img_h {
                break;
            }
            if win_w < MIN_FACE_SIZE.0 || win_h < MIN_FACE_SIZE.1 {
                factor *= SCALE_FACTOR;
                continue;
            }
            if scaled_w as u64 * scaled_h as u64 > MAX_INTEGRAL_PIXELS {
                tracing::debug!(factor, scaled_w, scaled_h, "skipping scale: image too large for integral sums");
                factor *= SCALE_FACTOR;
                continue;
            }

            let scaled: Cow<GrayImage> = if (scaled_w, scaled_h) == (img_w, img_h) {
                Cow::Borrowed(gray)
            } else {
                Cow::Owned(imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle))
            };
            let integral = IntegralImage::new(&scaled);
            let step = scan_step(factor);
            let positions_x = scaled_w - base_w + 1;
            let positions_y = scaled_h - base_h + 1;

            let mut y = 0;
            while y < positions_y {
                if expired() {
                    return Err(DetectorError::DeadlineExceeded);
                }
                let mut x = 0;
                while x < positions_x {
                    match self.cascade.evaluate(&integral, x, y) {
                        Verdict::Accepted => hits.push(Rect::new(
                            (x as f64 * factor).round() as i32,
                            (y as f64 * factor).round() as i32,
                            win_w as i32,
                            win_h as i32,
                        )),
                        // A window failing the first stage makes its
                        // neighbour unlikely to pass; skip it.
                        Verdict::Rejected(0) => x += step,
                        Verdict::Rejected(_) => {}
                    }
                    x += step;
                }
                y += step;
            }

            factor *= SCALE_FACTOR;
        }

        Ok(hits)
    }

    fn run(&self, image: &RgbImage, deadline: Option<Instant>) -> Option<Vec<BoundingBox>> {
        let gray = to_luma(image);
        match self.detect_gray_until(&gray, deadline) {
            Ok(faces) => Some(faces),
            Err(DetectorError::DeadlineExceeded) => {
                tracing::debug!("face detection abandoned at deadline");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "face detection failed; reporting no faces");
                Some(Vec::new())
            }
        }
    }
}

/// Window stride at a given scale factor.
fn scan_step(factor: f64) -> u32 {
    if factor >= 2.0 {
        1
    } else {
        2
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, image: &RgbImage) -> Vec<BoundingBox> {
        self.run(image, None).unwrap_or_default()
    }

    fn detect_until(&self, image: &RgbImage, deadline: Instant) -> Option<Vec<BoundingBox>> {
        self.run(image, Some(deadline))
    }
}

/// Clip a grouped rectangle to the image, dropping it if nothing remains.
fn clamp_to_image(group: &Group, width: u32, height: u32) -> Option<BoundingBox> {
    let r = group.rect;
    let x0 = r.x.max(0) as i64;
    let y0 = r.y.max(0) as i64;
    let x1 = (r.x as i64 + r.width as i64).min(width as i64);
    let y1 = (r.y as i64 + r.height as i64).min(height as i64);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(BoundingBox {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
        neighbors: group.neighbors,
    })
}

/// Convert RGB to 8-bit luma with `Y = 0.299 R + 0.587 G + 0.114 B`.
///
/// Uses 14-bit fixed-point weights with rounding, matching the usual
/// RGB→gray conversion of computer-vision libraries.
pub fn to_luma(image: &RgbImage) -> GrayImage {
    const R: u32 = 4899;
    const G: u32 = 9617;
    const B: u32 = 1868;
    const SHIFT: u32 = 14;

    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let luma = (r as u32 * R + g as u32 * G + b as u32 * B + (1 << (SHIFT - 1))) >> SHIFT;
        Luma([luma as u8])
    })
}

/// The primary face: largest area, earliest on ties.
pub fn primary_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().fold(None, |best, face| match best {
        Some(b) if b.area() >= face.area() => Some(b),
        _ => Some(face),
    })
}
