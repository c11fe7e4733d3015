use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facematch_core::{
    decode_image, primary_face, BoundingBox, CascadeDetector, CompareOptions, Comparator,
    ComparisonRequest, FaceDetector, ImageBuffer,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facematch", about = "facematch face comparison CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rank candidate images by similarity to a reference image
    Compare {
        /// Reference image containing the face to match
        reference: PathBuf,
        /// Candidate images (at most 50)
        #[arg(required = true)]
        candidates: Vec<PathBuf>,
        /// Haar cascade XML (default: model dir / haarcascade_frontalface_default.xml)
        #[arg(long)]
        cascade: Option<PathBuf>,
        /// Concurrent candidate workers (default: logical CPUs)
        #[arg(long)]
        workers: Option<usize>,
        /// Per-candidate timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },
    /// Detect faces in a single image
    Detect {
        image: PathBuf,
        #[arg(long)]
        cascade: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct DetectReport<'a> {
    width: u32,
    height: u32,
    faces: &'a [BoundingBox],
    primary: Option<&'a BoundingBox>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compare {
            reference,
            candidates,
            cascade,
            workers,
            timeout_secs,
            pretty,
        } => {
            let detector = load_detector(cascade)?;
            let mut options = CompareOptions {
                candidate_timeout: Duration::from_secs(timeout_secs),
                ..CompareOptions::default()
            };
            if let Some(workers) = workers {
                options.workers = workers.max(1);
            }

            let reference = read_image(&reference)?;
            let candidates = candidates
                .iter()
                .map(|path| read_image(path))
                .collect::<Result<Vec<_>>>()?;

            let comparator = Comparator::new(Arc::new(detector), options);
            let response = comparator
                .compare(ComparisonRequest::new(reference, candidates))
                .await
                .context("comparison failed")?;

            if let Some(best) = response.results.first() {
                tracing::info!(
                    index = best.image_index,
                    similarity = best.similarity_percentage,
                    failed = response.results.iter().filter(|r| r.error_message.is_some()).count(),
                    "best match"
                );
            }
            print_json(&response, pretty)?;
        }
        Commands::Detect { image, cascade } => {
            let detector = load_detector(cascade)?;
            let buffer = read_image(&image)?;
            let decoded = decode_image(&buffer)
                .with_context(|| format!("decoding {}", image.display()))?;

            let faces = detector.detect(&decoded);
            tracing::debug!(faces = faces.len(), "detection finished");
            let report = DetectReport {
                width: decoded.width(),
                height: decoded.height(),
                faces: &faces,
                primary: primary_face(&faces),
            };
            print_json(&report, true)?;
        }
    }

    Ok(())
}

fn load_detector(cascade: Option<PathBuf>) -> Result<CascadeDetector> {
    let path = cascade.unwrap_or_else(default_cascade_path);
    let detector = CascadeDetector::load(&path)
        .with_context(|| format!("loading cascade {}", path.display()))?;
    let cascade = detector.cascade();
    tracing::info!(
        path = %path.display(),
        stages = cascade.stage_count(),
        window = ?cascade.window_size(),
        "cascade loaded"
    );
    Ok(detector)
}

fn default_cascade_path() -> PathBuf {
    std::env::var("FACEMATCH_CASCADE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            facematch_core::default_model_dir().join(facematch_core::DEFAULT_CASCADE_FILE)
        })
}

/// Read an image file, tagging it with the media type implied by its extension.
fn read_image(path: &Path) -> Result<ImageBuffer> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    tracing::debug!(path = %path.display(), bytes = data.len(), "image read");
    let buffer = ImageBuffer::new(data);
    Ok(match image::ImageFormat::from_path(path) {
        Ok(format) => buffer.with_media_type(format.to_mime_type()),
        Err(_) => buffer,
    })
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let out = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{out}");
    Ok(())
}
