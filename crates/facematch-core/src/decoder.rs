//! Image decoding — uploaded bytes to a canonical 8-bit RGB pixel grid.

use crate::types::ImageBuffer;
use image::{ImageFormat, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid image format: {0}")]
    Malformed(String),
    #[error("image has zero width or height")]
    ZeroDimensions,
}

/// Decode an uploaded buffer into RGB.
///
/// The format is sniffed from the content. When sniffing fails and the
/// declared media type names a known format, decoding is retried with it
/// (formats such as TGA carry no magic bytes). Alpha is dropped, palette and
/// grayscale sources are expanded to three channels.
pub fn decode_image(buffer: &ImageBuffer) -> Result<RgbImage, DecodeError> {
    let decoded = match image::load_from_memory(&buffer.data) {
        Ok(img) => img,
        Err(sniff_err) => {
            let hinted = buffer
                .media_type
                .as_deref()
                .and_then(ImageFormat::from_mime_type);
            match hinted {
                Some(format) => {
                    tracing::debug!(?format, "content sniffing failed, retrying with declared type");
                    image::load_from_memory_with_format(&buffer.data, format)
                        .map_err(|e| DecodeError::Malformed(e.to_string()))?
                }
                None => return Err(DecodeError::Malformed(sniff_err.to_string())),
            }
        }
    };

    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(DecodeError::ZeroDimensions);
    }

    Ok(decoded.to_rgb8())
}
