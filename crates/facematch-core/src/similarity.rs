//! Descriptor similarity scoring.

use crate::descriptor::Descriptor;

/// Cosine similarity in [-1, 1], or `None` for mismatched, empty,
/// zero-norm or non-finite inputs.
///
/// Computed in `f64` as `dot / sqrt(|a|² · |b|²)`, which makes identical
/// inputs score exactly 1.0 and keeps the result symmetric bit for bit.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    if !(denom > 0.0 && denom.is_finite()) {
        return None;
    }
    let cosine = dot / denom;
    cosine.is_finite().then_some(cosine)
}

/// Similarity as a percentage in [0, 100].
///
/// Either side being the "no descriptor" sentinel, or any numerical failure,
/// scores 0.0.
pub fn similarity_percentage(a: Option<&Descriptor>, b: Option<&Descriptor>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.0;
    };
    match cosine_similarity(a.values(), b.values()) {
        Some(cosine) => (cosine * 100.0).clamp(0.0, 100.0),
        None => 0.0,
    }
}
