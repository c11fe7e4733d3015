//! End-to-end comparison tests over synthetic images.

use facematch_core::compare::MAX_CANDIDATES;
use facematch_core::{
    BoundingBox, CascadeDetector, CompareError, CompareOptions, Comparator, ComparisonRequest,
    FaceDetector, HaarCascade, ImageBuffer,
};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FIXTURE: &str = include_str!("fixtures/center_surround.xml");

fn png(img: &RgbImage) -> ImageBuffer {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    ImageBuffer::new(buf.into_inner()).with_media_type("image/png")
}

fn square_on_white(size: u32, side: u32, shade: u8) -> RgbImage {
    let start = (size - side) / 2;
    RgbImage::from_fn(size, size, |x, y| {
        if (start..start + side).contains(&x) && (start..start + side).contains(&y) {
            Rgb([shade, shade, shade])
        } else {
            Rgb([255, 255, 255])
        }
    })
}

fn gradient(width: u32, height: u32, seed: u8) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let v = (x + y * 2) as u8 ^ seed;
        Rgb([v, v.wrapping_add(40), seed])
    })
}

fn cascade_comparator(options: CompareOptions) -> Comparator {
    let detector = CascadeDetector::new(HaarCascade::from_xml(FIXTURE).unwrap());
    Comparator::new(Arc::new(detector), options)
}

/// Reports one face covering the whole image, with hooks keyed on image width.
///
/// A `cooperative` detector gives up on slow images once the deadline passes;
/// otherwise slow images block for the full [`SLOW_DELAY`].
#[derive(Default)]
struct WholeImageDetector {
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
    cooperative: bool,
}

const SLOW_WIDTH: u32 = 77;
const PANIC_WIDTH: u32 = 66;
const SLOW_DELAY: Duration = Duration::from_millis(1500);

impl WholeImageDetector {
    fn run(&self, image: &RgbImage, deadline: Option<Instant>) -> Option<Vec<BoundingBox>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if image.width() == PANIC_WIDTH {
            self.active.fetch_sub(1, Ordering::SeqCst);
            panic!("detector fault");
        }
        if image.width() == SLOW_WIDTH {
            let until = Instant::now() + SLOW_DELAY;
            while Instant::now() < until {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    return None;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        } else if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        Some(vec![BoundingBox {
            x: 0,
            y: 0,
            width: image.width(),
            height: image.height(),
            neighbors: 6,
        }])
    }
}

impl FaceDetector for WholeImageDetector {
    fn detect(&self, image: &RgbImage) -> Vec<BoundingBox> {
        self.run(image, None).unwrap_or_default()
    }

    fn detect_until(&self, image: &RgbImage, deadline: Instant) -> Option<Vec<BoundingBox>> {
        self.run(image, self.cooperative.then_some(deadline))
    }
}

fn options(workers: usize, timeout: Duration) -> CompareOptions {
    CompareOptions {
        workers,
        candidate_timeout: timeout,
        ..CompareOptions::default()
    }
}

#[tokio::test]
async fn test_mixed_batch_with_cascade() {
    let comparator = cascade_comparator(options(4, Duration::from_secs(30)));
    let reference = square_on_white(200, 60, 0);

    let request = ComparisonRequest::new(
        png(&reference),
        vec![
            ImageBuffer::new(b"definitely not an image".to_vec()),
            png(&RgbImage::from_pixel(200, 200, Rgb([128, 128, 128]))),
            png(&reference),
            png(&square_on_white(200, 60, 90)),
        ],
    );
    let response = comparator.compare(request).await.unwrap();

    assert!(response.base_image_has_face);
    assert!(response
        .base_image_data
        .as_deref()
        .unwrap()
        .starts_with("data:image/jpeg;base64,"));
    assert_eq!(response.total_images, 4);
    assert_eq!(response.results.len(), 4);
    assert!(response.processing_time >= 0.0);

    let first = &response.results[0];
    assert_eq!(first.image_index, 2);
    assert_eq!(first.similarity_percentage, 100.0);
    assert!(first.has_face);
    assert!(first.error_message.is_none());

    for pair in response.results.windows(2) {
        assert!(pair[0].similarity_percentage >= pair[1].similarity_percentage);
    }

    let by_index = |i: usize| response.results.iter().find(|r| r.image_index == i).unwrap();

    let garbage = by_index(0);
    assert_eq!(garbage.similarity_percentage, 0.0);
    assert!(!garbage.has_face);
    assert!(garbage.image_data.is_none());
    assert!(garbage
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("error processing image"));

    let uniform = by_index(1);
    assert_eq!(uniform.similarity_percentage, 0.0);
    assert!(!uniform.has_face);
    assert!(uniform.image_data.is_some());
    assert_eq!(uniform.error_message.as_deref(), Some("no face detected in this image"));

    let gray_square = by_index(3);
    assert!(gray_square.has_face);
    assert!(gray_square.error_message.is_none());
    assert!(gray_square.similarity_percentage < 100.0);
}

#[tokio::test]
async fn test_single_invalid_candidate() {
    let comparator = cascade_comparator(CompareOptions::default());
    let request = ComparisonRequest::new(
        png(&square_on_white(200, 60, 0)),
        vec![ImageBuffer::new(b"not an image".to_vec())],
    );
    let response = comparator.compare(request).await.unwrap();

    assert!(response.base_image_has_face);
    assert_eq!(response.total_images, 1);
    assert_eq!(response.results.len(), 1);

    let only = &response.results[0];
    assert_eq!(only.image_index, 0);
    assert_eq!(only.similarity_percentage, 0.0);
    assert!(!only.has_face);
    assert!(only.image_data.is_none());
    assert!(only
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("error processing image"));
}

#[tokio::test]
async fn test_reference_without_face_is_fatal() {
    let comparator = cascade_comparator(CompareOptions::default());
    let request = ComparisonRequest::new(
        png(&RgbImage::from_pixel(120, 120, Rgb([255, 255, 255]))),
        vec![png(&square_on_white(200, 60, 0))],
    );
    let err = comparator.compare(request).await.unwrap_err();
    assert!(matches!(err, CompareError::NoFaceInReference));
    assert_eq!(err.code(), "no_face_in_reference");
}

#[tokio::test]
async fn test_undecodable_reference_is_fatal() {
    let comparator = cascade_comparator(CompareOptions::default());
    let request = ComparisonRequest::new(ImageBuffer::new(vec![0u8; 16]), vec![]);
    let err = comparator.compare(request).await.unwrap_err();
    assert!(matches!(err, CompareError::ReferenceDecode(_)));
    assert!(err.is_client_error());
}

#[tokio::test]
async fn test_too_many_candidates_touches_nothing() {
    let detector = Arc::new(WholeImageDetector::default());
    let comparator = Comparator::new(detector.clone(), CompareOptions::default());

    let candidates = vec![ImageBuffer::new(vec![1u8, 2, 3]); MAX_CANDIDATES + 1];
    let request = ComparisonRequest::new(png(&gradient(40, 40, 1)), candidates);
    let err = comparator.compare(request).await.unwrap_err();

    assert!(matches!(err, CompareError::TooManyCandidates(51)));
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fifty_candidates_accepted() {
    let detector = Arc::new(WholeImageDetector::default());
    let comparator = Comparator::new(detector.clone(), options(8, Duration::from_secs(30)));

    let candidate = png(&gradient(32, 32, 9));
    let request = ComparisonRequest::new(png(&gradient(32, 32, 9)), vec![candidate; MAX_CANDIDATES]);
    let response = comparator.compare(request).await.unwrap();

    assert_eq!(response.results.len(), MAX_CANDIDATES);
    assert!(response.results.iter().all(|r| r.similarity_percentage == 100.0));
    let indices: Vec<usize> = response.results.iter().map(|r| r.image_index).collect();
    assert_eq!(indices, (0..MAX_CANDIDATES).collect::<Vec<_>>());
    assert_eq!(detector.calls.load(Ordering::SeqCst), MAX_CANDIDATES + 1);
}

#[tokio::test]
async fn test_empty_candidate_list() {
    let comparator = Comparator::new(Arc::new(WholeImageDetector::default()), CompareOptions::default());
    let response = comparator
        .compare(ComparisonRequest::new(png(&gradient(40, 40, 3)), vec![]))
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.total_images, 0);
}

#[tokio::test]
async fn test_ranking_ignores_upload_position() {
    let comparator = Comparator::new(Arc::new(WholeImageDetector::default()), CompareOptions::default());
    let reference = gradient(64, 64, 17);
    let others = [gradient(64, 64, 200), gradient(48, 80, 90), gradient(64, 64, 33)];

    for position in 0..=others.len() {
        let mut candidates: Vec<ImageBuffer> = others.iter().map(png).collect();
        candidates.insert(position, png(&reference));

        let response = comparator
            .compare(ComparisonRequest::new(png(&reference), candidates))
            .await
            .unwrap();
        assert_eq!(response.results[0].image_index, position);
        assert_eq!(response.results[0].similarity_percentage, 100.0);
    }
}

#[tokio::test]
async fn test_worker_pool_is_bounded() {
    let detector = Arc::new(WholeImageDetector {
        delay: Duration::from_millis(30),
        ..WholeImageDetector::default()
    });
    let comparator = Comparator::new(detector.clone(), options(2, Duration::from_secs(30)));

    let candidates = (0..8).map(|i| png(&gradient(40, 40, i))).collect();
    let response = comparator
        .compare(ComparisonRequest::new(png(&gradient(40, 40, 99)), candidates))
        .await
        .unwrap();

    assert_eq!(response.results.len(), 8);
    assert!(detector.max_active.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_slow_candidate_times_out_without_aborting_batch() {
    let comparator = Comparator::new(
        Arc::new(WholeImageDetector::default()),
        options(4, Duration::from_millis(200)),
    );
    let reference = gradient(40, 40, 5);
    let request = ComparisonRequest::new(
        png(&reference),
        vec![png(&gradient(SLOW_WIDTH, 40, 5)), png(&reference)],
    );
    let response = comparator.compare(request).await.unwrap();

    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].image_index, 1);
    assert_eq!(response.results[0].similarity_percentage, 100.0);

    let slow = &response.results[1];
    assert_eq!(slow.image_index, 0);
    assert_eq!(slow.similarity_percentage, 0.0);
    assert!(slow.error_message.as_deref().unwrap().contains("timed out"));
}

/// One worker, a candidate that blocks far past the timeout, then two quick
/// ones: the quick ones must not wait for the blocked one.
async fn run_stuck_first_batch(detector: Arc<WholeImageDetector>) -> Duration {
    let comparator = Comparator::new(detector, options(1, Duration::from_millis(200)));
    let reference = gradient(40, 40, 12);
    let request = ComparisonRequest::new(
        png(&reference),
        vec![png(&gradient(SLOW_WIDTH, 40, 12)), png(&reference), png(&reference)],
    );

    let started = Instant::now();
    let response = comparator.compare(request).await.unwrap();
    let elapsed = started.elapsed();

    let order: Vec<usize> = response.results.iter().map(|r| r.image_index).collect();
    assert_eq!(order, vec![1, 2, 0]);
    assert!(response.results[..2].iter().all(|r| r.similarity_percentage == 100.0));
    assert!(response.results[2].error_message.as_deref().unwrap().contains("timed out"));
    elapsed
}

#[tokio::test]
async fn test_timed_out_candidate_frees_its_worker() {
    let detector = Arc::new(WholeImageDetector::default());
    let elapsed = run_stuck_first_batch(detector).await;
    assert!(elapsed < Duration::from_secs(1), "batch took {elapsed:?}");
}

#[tokio::test]
async fn test_deadline_aware_detector_stops_at_timeout() {
    let detector = Arc::new(WholeImageDetector {
        cooperative: true,
        ..WholeImageDetector::default()
    });
    let elapsed = run_stuck_first_batch(detector.clone()).await;
    assert!(elapsed < Duration::from_secs(1), "batch took {elapsed:?}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(detector.active.load(Ordering::SeqCst), 0, "slow scan still running");
}

#[tokio::test]
async fn test_panicking_candidate_is_isolated() {
    let comparator = Comparator::new(
        Arc::new(WholeImageDetector::default()),
        options(2, Duration::from_secs(30)),
    );
    let reference = gradient(40, 40, 8);
    let request = ComparisonRequest::new(
        png(&reference),
        vec![png(&reference), png(&gradient(PANIC_WIDTH, 40, 8)), png(&reference)],
    );
    let response = comparator.compare(request).await.unwrap();

    assert_eq!(response.results.len(), 3);
    let failed = response.results.iter().find(|r| r.image_index == 1).unwrap();
    assert_eq!(failed.similarity_percentage, 0.0);
    assert!(!failed.has_face);
    assert!(failed.error_message.as_deref().unwrap().contains("worker failed"));

    let ok: Vec<usize> = response
        .results
        .iter()
        .filter(|r| r.error_message.is_none())
        .map(|r| r.image_index)
        .collect();
    assert_eq!(ok, vec![0, 2]);
}
