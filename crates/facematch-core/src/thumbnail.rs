//! JPEG preview thumbnails encoded as `data:` URIs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use std::borrow::Cow;
use thiserror::Error;

pub const THUMBNAIL_MAX: (u32, u32) = (150, 150);
pub const JPEG_QUALITY: u8 = 80;
const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Error, Debug)]
pub enum ThumbnailError {
    #[error("thumbnail bounds must be non-zero, got {0}x{1}")]
    InvalidBounds(u32, u32),
    #[error("empty source image")]
    EmptyImage,
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Dimensions that fit `(w, h)` inside `max` preserving aspect ratio.
///
/// Never upscales; each side is at least 1 pixel.
pub fn thumbnail_dimensions(width: u32, height: u32, max: (u32, u32)) -> (u32, u32) {
    let (max_w, max_h) = max;
    if width <= max_w && height <= max_h {
        return (width, height);
    }
    let scale = (max_w as f64 / width as f64).min(max_h as f64 / height as f64);
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_w);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_h);
    (w, h)
}

/// Encode a bounded JPEG preview of `image` as a base64 data URI.
pub fn encode_thumbnail(image: &RgbImage, max: (u32, u32)) -> Result<String, ThumbnailError> {
    if max.0 == 0 || max.1 == 0 {
        return Err(ThumbnailError::InvalidBounds(max.0, max.1));
    }
    if image.width() == 0 || image.height() == 0 {
        return Err(ThumbnailError::EmptyImage);
    }

    let (w, h) = thumbnail_dimensions(image.width(), image.height(), max);
    let thumb: Cow<RgbImage> = if (w, h) == image.dimensions() {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(imageops::resize(image, w, h, FilterType::Lanczos3))
    };

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY).write_image(
        thumb.as_raw(),
        w,
        h,
        ExtendedColorType::Rgb8,
    )?;

    let mut uri = String::with_capacity(DATA_URI_PREFIX.len() + buffer.len() * 4 / 3 + 4);
    uri.push_str(DATA_URI_PREFIX);
    STANDARD.encode_string(&buffer, &mut uri);
    Ok(uri)
}

/// Thumbnail data URI, or `None` if it could not be produced.
///
/// A missing thumbnail never fails a comparison.
pub fn render_thumbnail(image: &RgbImage, max: (u32, u32)) -> Option<String> {
    match encode_thumbnail(image, max) {
        Ok(uri) => Some(uri),
        Err(err) => {
            tracing::warn!(error = %err, "thumbnail rendering failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn decode_uri(uri: &str) -> image::DynamicImage {
        let payload = uri.strip_prefix(DATA_URI_PREFIX).expect("data uri prefix");
        let bytes = STANDARD.decode(payload).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "JPEG SOI marker");
        image::load_from_memory(&bytes).unwrap()
    }

    #[test]
    fn test_dimensions_preserve_aspect() {
        assert_eq!(thumbnail_dimensions(600, 300, (150, 150)), (150, 75));
        assert_eq!(thumbnail_dimensions(300, 600, (150, 150)), (75, 150));
        assert_eq!(thumbnail_dimensions(1000, 1000, (150, 150)), (150, 150));
    }

    #[test]
    fn test_dimensions_never_upscale() {
        assert_eq!(thumbnail_dimensions(80, 40, (150, 150)), (80, 40));
        assert_eq!(thumbnail_dimensions(150, 150, (150, 150)), (150, 150));
    }

    #[test]
    fn test_dimensions_extreme_aspect_keeps_one_pixel() {
        assert_eq!(thumbnail_dimensions(10_000, 2, (150, 150)), (150, 1));
    }

    #[test]
    fn test_thumbnail_decodes_within_bounds() {
        let img = RgbImage::from_fn(640, 480, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
        let uri = render_thumbnail(&img, THUMBNAIL_MAX).unwrap();
        let decoded = decode_uri(&uri);
        assert_eq!((decoded.width(), decoded.height()), (150, 113));
    }

    #[test]
    fn test_small_image_keeps_size() {
        let img = RgbImage::from_pixel(40, 30, Rgb([200, 10, 10]));
        let decoded = decode_uri(&render_thumbnail(&img, THUMBNAIL_MAX).unwrap());
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
    }

    #[test]
    fn test_zero_bounds_or_empty_image() {
        let img = RgbImage::from_pixel(40, 30, Rgb([0, 0, 0]));
        assert!(matches!(
            encode_thumbnail(&img, (0, 150)),
            Err(ThumbnailError::InvalidBounds(0, 150))
        ));
        assert!(render_thumbnail(&RgbImage::new(0, 0), THUMBNAIL_MAX).is_none());
    }
}
