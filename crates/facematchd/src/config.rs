use facematch_core::CompareOptions;
use std::path::PathBuf;
use std::time::Duration;

/// Allowed cross-origin callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsOrigins {
    /// `*`: any origin, no credentials.
    Any,
    List(Vec<String>),
}

impl CorsOrigins {
    /// Parse a comma-separated origin list; `*` (or nothing) allows any origin.
    pub fn parse(raw: &str) -> Self {
        let origins: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect();
        if origins.is_empty() || origins.iter().any(|o| o == "*") {
            Self::Any
        } else {
            Self::List(origins)
        }
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:8001).
    pub bind_addr: String,
    /// Directory containing cascade model files.
    pub model_dir: PathBuf,
    /// Haar cascade XML used for face detection.
    pub cascade_path: PathBuf,
    /// Path to the SQLite database holding status checks.
    pub db_path: PathBuf,
    /// Concurrent candidate workers per request.
    pub workers: usize,
    /// Per-candidate processing timeout in seconds.
    pub candidate_timeout_secs: u64,
    /// Maximum request body size in MiB.
    pub max_upload_mb: usize,
    pub cors_origins: CorsOrigins,
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// The model directory falls back to [`facematch_core::default_model_dir`],
    /// which always reads the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = lookup("FACEMATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(facematch_core::default_model_dir);

        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facematch");

        let cascade_path = lookup("FACEMATCH_CASCADE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| model_dir.join(facematch_core::DEFAULT_CASCADE_FILE));

        let db_path = lookup("FACEMATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("status.db"));

        Self {
            bind_addr: lookup("FACEMATCH_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8001".to_string()),
            model_dir,
            cascade_path,
            db_path,
            workers: parse_or(lookup("FACEMATCH_WORKERS"), default_workers()).max(1),
            candidate_timeout_secs: parse_or(lookup("FACEMATCH_CANDIDATE_TIMEOUT_SECS"), 30),
            max_upload_mb: parse_or(lookup("FACEMATCH_MAX_UPLOAD_MB"), 100),
            cors_origins: CorsOrigins::parse(
                &lookup("FACEMATCH_CORS_ORIGINS").unwrap_or_else(|| "*".to_string()),
            ),
        }
    }

    /// Comparator settings derived from this configuration.
    pub fn compare_options(&self) -> CompareOptions {
        CompareOptions {
            workers: self.workers,
            candidate_timeout: Duration::from_secs(self.candidate_timeout_secs),
            ..CompareOptions::default()
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

fn default_workers() -> usize {
    CompareOptions::default().workers
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
