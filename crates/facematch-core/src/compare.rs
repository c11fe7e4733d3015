//! Batch comparison of candidate images against one reference image.
//!
//! The reference is processed once; candidates fan out over a bounded pool of
//! blocking workers. A candidate failure (bad bytes, no face, timeout, panic)
//! becomes that candidate's result and never aborts the batch.

use crate::decoder::{decode_image, DecodeError};
use crate::descriptor::{extract_descriptor, Descriptor};
use crate::detector::FaceDetector;
use crate::similarity::similarity_percentage;
use crate::thumbnail::{render_thumbnail, THUMBNAIL_MAX};
use crate::types::{ComparisonResponse, ComparisonResult, ImageBuffer};
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};

// --- Named constants ---
pub const MAX_CANDIDATES: usize = 50;
pub const DEFAULT_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Request-level failures. Any of these aborts the whole comparison.
#[derive(Error, Debug)]
pub enum CompareError {
    #[error("maximum 50 comparison images allowed, got {0}")]
    TooManyCandidates(usize),
    #[error("invalid base image: {0}")]
    ReferenceDecode(#[source] DecodeError),
    #[error("no face detected in the base image; upload an image with at least one visible face")]
    NoFaceInReference,
    #[error("could not extract face features from the base image")]
    ReferenceDescriptor,
    #[error("internal error: {0}")]
    Internal(String),
}

impl CompareError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TooManyCandidates(_) => "too_many_candidates",
            Self::ReferenceDecode(_) => "invalid_reference_image",
            Self::NoFaceInReference => "no_face_in_reference",
            Self::ReferenceDescriptor => "reference_descriptor_failed",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the request itself was at fault (as opposed to the service).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

/// Per-candidate failures, rendered into `ComparisonResult::error_message`.
#[derive(Error, Debug)]
pub enum CandidateError {
    #[error("error processing image: {0}")]
    Decode(#[from] DecodeError),
    #[error("no face detected in this image")]
    NoFace,
    #[error("could not extract face features")]
    Descriptor,
    #[error("processing timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),
    #[error("error processing image: worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone)]
pub struct CompareOptions {
    /// Maximum number of candidates processed concurrently.
    pub workers: usize,
    pub candidate_timeout: Duration,
    pub thumbnail_max: (u32, u32),
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            candidate_timeout: DEFAULT_CANDIDATE_TIMEOUT,
            thumbnail_max: THUMBNAIL_MAX,
        }
    }
}

/// One reference image and up to [`MAX_CANDIDATES`] candidates, in upload order.
#[derive(Debug, Clone)]
pub struct ComparisonRequest {
    pub reference: ImageBuffer,
    pub candidates: Vec<ImageBuffer>,
    /// Start of the processing-time measurement.
    pub received_at: Instant,
}

impl ComparisonRequest {
    pub fn new(reference: ImageBuffer, candidates: Vec<ImageBuffer>) -> Self {
        Self {
            reference,
            candidates,
            received_at: Instant::now(),
        }
    }
}

/// Where a candidate got to before finishing; logged with each outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateStage {
    Pending,
    Decoded,
    FaceChecked,
    Scored,
}

/// Time allowed for one candidate, shared between the waiting task and the
/// blocking work so the work can stop itself once the wait is over.
#[derive(Debug, Clone, Copy)]
struct Budget {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Budget {
    fn starting_now(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now().checked_add(timeout),
        }
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

struct PreparedReference {
    descriptor: Descriptor,
    thumbnail: Option<String>,
}

/// Runs comparison requests against a shared detector.
#[derive(Clone)]
pub struct Comparator {
    detector: Arc<dyn FaceDetector>,
    options: CompareOptions,
}

impl Comparator {
    pub fn new(detector: Arc<dyn FaceDetector>, options: CompareOptions) -> Self {
        Self { detector, options }
    }

    pub fn options(&self) -> &CompareOptions {
        &self.options
    }

    /// Compare every candidate against the reference.
    ///
    /// Results are sorted by similarity, highest first; equal scores keep
    /// upload order. Dropping the returned future stops new candidates from
    /// being started; work already running finishes and is discarded.
    pub async fn compare(
        &self,
        request: ComparisonRequest,
    ) -> Result<ComparisonResponse, CompareError> {
        let ComparisonRequest {
            reference,
            candidates,
            received_at,
        } = request;

        let total = candidates.len();
        if total > MAX_CANDIDATES {
            return Err(CompareError::TooManyCandidates(total));
        }

        let prepared = self.prepare_reference(reference).await?;
        let reference = Arc::new(prepared.descriptor);

        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let (tx, mut rx) = mpsc::channel::<ComparisonResult>(total.max(1));
        let timeout = self.options.candidate_timeout;
        let thumbnail_max = self.options.thumbnail_max;

        for (index, buffer) in candidates.into_iter().enumerate() {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| CompareError::Internal("worker pool closed".into()))?;
            let detector = Arc::clone(&self.detector);
            let reference = Arc::clone(&reference);
            let tx = tx.clone();

            tokio::spawn(async move {
                let budget = Budget::starting_now(timeout);
                let work = tokio::task::spawn_blocking(move || {
                    process_candidate(&*detector, &reference, index, &buffer, thumbnail_max, budget)
                });

                let result = match tokio::time::timeout(timeout, work).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => {
                        tracing::warn!(index, error = %join_err, "candidate worker failed");
                        failed_result(index, CandidateError::Worker(join_err.to_string()), None)
                    }
                    Err(_) => {
                        tracing::warn!(index, timeout_secs = timeout.as_secs_f64(), "candidate timed out");
                        failed_result(index, CandidateError::TimedOut(timeout), None)
                    }
                };
                // Abandoned work stops at its next deadline check; it does not
                // hold a worker slot meanwhile.
                drop(permit);
                // The receiver is gone only if the caller abandoned the request.
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        if results.len() != total {
            return Err(CompareError::Internal(format!(
                "collected {} of {total} candidate results",
                results.len()
            )));
        }

        rank_results(&mut results);

        let processing_time = received_at.elapsed().as_secs_f64();
        tracing::info!(
            candidates = total,
            matched = results.iter().filter(|r| r.error_message.is_none()).count(),
            processing_time,
            "comparison finished"
        );

        Ok(ComparisonResponse {
            base_image_has_face: true,
            base_image_data: prepared.thumbnail,
            results,
            total_images: total,
            processing_time,
        })
    }

    async fn prepare_reference(&self, buffer: ImageBuffer) -> Result<PreparedReference, CompareError> {
        let detector = Arc::clone(&self.detector);
        let thumbnail_max = self.options.thumbnail_max;

        let prepared = tokio::task::spawn_blocking(move || {
            let image = decode_image(&buffer).map_err(CompareError::ReferenceDecode)?;
            let faces = detector.detect(&image);
            if faces.is_empty() {
                return Err(CompareError::NoFaceInReference);
            }
            let descriptor =
                extract_descriptor(&image, &faces).ok_or(CompareError::ReferenceDescriptor)?;
            tracing::debug!(faces = faces.len(), "reference prepared");
            Ok(PreparedReference {
                descriptor,
                thumbnail: render_thumbnail(&image, thumbnail_max),
            })
        })
        .await
        .map_err(|e| CompareError::Internal(format!("reference worker failed: {e}")))?;

        if let Err(err) = &prepared {
            tracing::warn!(code = err.code(), error = %err, "reference image rejected");
        }
        prepared
    }
}

/// Decode, detect, describe and score one candidate.
fn process_candidate(
    detector: &dyn FaceDetector,
    reference: &Descriptor,
    index: usize,
    buffer: &ImageBuffer,
    thumbnail_max: (u32, u32),
    budget: Budget,
) -> ComparisonResult {
    let mut stage = CandidateStage::Pending;
    let outcome = score_candidate(detector, reference, buffer, thumbnail_max, budget, &mut stage);

    match outcome {
        Ok((similarity, thumbnail)) => {
            tracing::debug!(index, ?stage, similarity, "candidate scored");
            ComparisonResult {
                image_index: index,
                similarity_percentage: similarity,
                has_face: true,
                image_data: thumbnail,
                error_message: None,
            }
        }
        Err((err, thumbnail)) => {
            tracing::debug!(index, ?stage, error = %err, "candidate errored");
            failed_result(index, err, thumbnail)
        }
    }
}

type CandidateOutcome = Result<(f64, Option<String>), (CandidateError, Option<String>)>;

fn score_candidate(
    detector: &dyn FaceDetector,
    reference: &Descriptor,
    buffer: &ImageBuffer,
    thumbnail_max: (u32, u32),
    budget: Budget,
    stage: &mut CandidateStage,
) -> CandidateOutcome {
    let timed_out = |thumbnail: Option<String>| (CandidateError::TimedOut(budget.timeout), thumbnail);

    let image: RgbImage = decode_image(buffer).map_err(|e| (CandidateError::from(e), None))?;
    *stage = CandidateStage::Decoded;
    if budget.expired() {
        return Err(timed_out(None));
    }
    let thumbnail = render_thumbnail(&image, thumbnail_max);

    let faces = match budget.deadline {
        Some(deadline) => detector.detect_until(&image, deadline),
        None => Some(detector.detect(&image)),
    };
    let Some(faces) = faces else {
        return Err(timed_out(thumbnail));
    };
    *stage = CandidateStage::FaceChecked;
    if faces.is_empty() {
        return Err((CandidateError::NoFace, thumbnail));
    }
    if budget.expired() {
        return Err(timed_out(thumbnail));
    }

    let Some(descriptor) = extract_descriptor(&image, &faces) else {
        return Err((CandidateError::Descriptor, thumbnail));
    };

    let similarity = similarity_percentage(Some(reference), Some(&descriptor));
    *stage = CandidateStage::Scored;
    Ok((similarity, thumbnail))
}

fn failed_result(index: usize, err: CandidateError, thumbnail: Option<String>) -> ComparisonResult {
    ComparisonResult {
        image_index: index,
        similarity_percentage: 0.0,
        // A descriptor failure happens only after a face was found.
        has_face: matches!(err, CandidateError::Descriptor),
        image_data: thumbnail,
        error_message: Some(err.to_string()),
    }
}

/// Sort by similarity descending; ties keep ascending `image_index`.
fn rank_results(results: &mut [ComparisonResult]) {
    results.sort_by_key(|r| r.image_index);
    results.sort_by(|a, b| b.similarity_percentage.total_cmp(&a.similarity_percentage));
}
