use serde::{Deserialize, Serialize};

/// Raw encoded image bytes as uploaded, with the media type the client declared.
#[derive(Debug, Clone, Default)]
pub struct ImageBuffer {
    pub data: Vec<u8>,
    /// Declared media type (e.g., "image/jpeg"), if the transport carried one.
    pub media_type: Option<String>,
}

impl ImageBuffer {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// Axis-aligned face bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of raw cascade hits merged into this box.
    pub neighbors: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether the point lies inside the box (right/bottom edges exclusive).
    pub fn contains(&self, px: u32, py: u32) -> bool {
        px >= self.x && py >= self.y && px < self.x + self.width && py < self.y + self.height
    }
}

/// Outcome of comparing one candidate image against the reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    /// Position of the candidate in upload order (0-based).
    pub image_index: usize,
    /// Similarity to the reference in [0, 100]. Always 0.0 for failed candidates.
    pub similarity_percentage: f64,
    pub has_face: bool,
    /// Thumbnail as a `data:image/jpeg;base64,...` URI.
    pub image_data: Option<String>,
    pub error_message: Option<String>,
}

/// Aggregate response for one comparison request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResponse {
    pub base_image_has_face: bool,
    pub base_image_data: Option<String>,
    /// Sorted by similarity, highest first.
    pub results: Vec<ComparisonResult>,
    /// Number of candidates as submitted.
    pub total_images: usize,
    /// Wall-clock processing time in seconds.
    pub processing_time: f64,
}
