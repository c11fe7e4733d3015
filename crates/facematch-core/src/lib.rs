//! facematch-core — Face comparison engine.
//!
//! Detects faces with an OpenCV-format Haar cascade, describes the primary
//! face by its intensity histogram and ranks a batch of candidate images by
//! cosine similarity to a reference image.

pub mod cascade;
pub mod compare;
pub mod decoder;
pub mod descriptor;
pub mod detector;
pub mod grouping;
pub mod similarity;
pub mod thumbnail;
pub mod types;

use std::path::PathBuf;

pub use cascade::{CascadeError, HaarCascade};
pub use compare::{CandidateError, CompareError, CompareOptions, Comparator, ComparisonRequest};
pub use decoder::{decode_image, DecodeError};
pub use descriptor::{extract_descriptor, Descriptor};
pub use detector::{primary_face, CascadeDetector, FaceDetector};
pub use similarity::similarity_percentage;
pub use thumbnail::render_thumbnail;
pub use types::{BoundingBox, ComparisonResponse, ComparisonResult, ImageBuffer};

/// File name of the frontal-face cascade shipped with OpenCV.
pub const DEFAULT_CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";

/// Default directory holding cascade model files.
///
/// `$XDG_DATA_HOME/facematch/models`, falling back to
/// `~/.local/share/facematch/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facematch")
        .join("models")
}
