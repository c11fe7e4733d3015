use crate::config::{Config, CorsOrigins};
use crate::status::{StatusCheck, StatusCheckCreate, StatusStore, StoreError, MAX_LISTED};
use anyhow::Context;
use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use facematch_core::{
    CascadeDetector, CompareError, Comparator, ComparisonRequest, ComparisonResponse, ImageBuffer,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

const BASE_IMAGE_FIELD: &str = "base_image";
const CANDIDATE_FIELD: &str = "comparison_images";

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub comparator: Comparator,
    pub store: StatusStore,
}

impl AppState {
    pub fn new(comparator: Comparator, store: StatusStore) -> Self {
        Self { comparator, store }
    }
}

/// Errors surfaced to API clients as `{"detail": ..., "code": ...}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Compare(#[from] CompareError),
    #[error("field required: {0}")]
    MissingField(&'static str),
    #[error("{message}")]
    Multipart { status: StatusCode, message: String },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
    code: &'static str,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Compare(err) if err.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Compare(_) | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MissingField(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Multipart { status, .. } => *status,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Compare(err) => err.code(),
            Self::MissingField(_) => "missing_field",
            Self::Multipart { status, .. } if *status == StatusCode::PAYLOAD_TOO_LARGE => {
                "payload_too_large"
            }
            Self::Multipart { .. } => "malformed_multipart",
            Self::Storage(_) => "internal_error",
        }
    }

    fn multipart(status: StatusCode, message: impl Into<String>) -> Self {
        // Malformed bodies are the client's fault whatever axum reports.
        let status = if status.is_client_error() { status } else { StatusCode::BAD_REQUEST };
        Self::Multipart {
            status,
            message: message.into(),
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::multipart(rejection.status(), rejection.body_text())
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        Self::multipart(err.status(), err.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        let body = ErrorBody {
            detail: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the API router with all endpoints.
pub fn build_router(state: AppState, config: &Config) -> Router {
    Router::new()
        .route("/api/", get(root))
        .route("/api/status", post(create_status_check).get(list_status_checks))
        .route("/api/compare-faces", post(compare_faces))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &CorsOrigins) -> CorsLayer {
    match origins {
        CorsOrigins::Any => CorsLayer::permissive(),
        CorsOrigins::List(list) => {
            let allowed: Vec<HeaderValue> = list
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(allowed))
                .allow_credentials(true)
                .allow_methods(AllowMethods::mirror_request())
                .allow_headers(AllowHeaders::mirror_request())
        }
    }
}

pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "Face Comparison API" }))
}

pub async fn create_status_check(
    State(state): State<AppState>,
    Json(input): Json<StatusCheckCreate>,
) -> Result<Json<StatusCheck>, ApiError> {
    let check = state.store.record(input.client_name).await?;
    Ok(Json(check))
}

pub async fn list_status_checks(
    State(state): State<AppState>,
) -> Result<Json<Vec<StatusCheck>>, ApiError> {
    Ok(Json(state.store.list(MAX_LISTED).await?))
}

/// `POST /api/compare-faces`: one `base_image` and one or more `comparison_images`.
pub async fn compare_faces(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ComparisonResponse>, ApiError> {
    let received_at = Instant::now();
    let mut multipart = multipart?;

    let mut reference: Option<ImageBuffer> = None;
    let mut candidates: Vec<ImageBuffer> = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        if name != BASE_IMAGE_FIELD && name != CANDIDATE_FIELD {
            tracing::debug!(field = %name, "ignoring unknown multipart field");
            continue;
        }

        let media_type = field.content_type().map(str::to_owned);
        let data = field.bytes().await?;
        let mut buffer = ImageBuffer::new(data.to_vec());
        if let Some(media_type) = media_type {
            buffer = buffer.with_media_type(media_type);
        }

        if name == BASE_IMAGE_FIELD {
            if reference.is_some() {
                return Err(ApiError::multipart(
                    StatusCode::BAD_REQUEST,
                    "only one base_image may be uploaded",
                ));
            }
            reference = Some(buffer);
        } else {
            candidates.push(buffer);
        }
    }

    let reference = reference.ok_or(ApiError::MissingField(BASE_IMAGE_FIELD))?;
    if candidates.is_empty() {
        return Err(ApiError::MissingField(CANDIDATE_FIELD));
    }

    tracing::info!(candidates = candidates.len(), "comparison requested");
    let request = ComparisonRequest {
        reference,
        candidates,
        received_at,
    };
    let response = state.comparator.compare(request).await?;
    Ok(Json(response))
}

/// Load resources, bind and serve until Ctrl-C.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let detector = CascadeDetector::load(&config.cascade_path)
        .with_context(|| format!("loading cascade {}", config.cascade_path.display()))?;
    let comparator = Comparator::new(Arc::new(detector), config.compare_options());

    let store = StatusStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening status store {}", config.db_path.display()))?;

    let app = build_router(AppState::new(comparator, store), &config);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    tracing::info!(
        addr = %config.bind_addr,
        workers = config.workers,
        timeout_secs = config.candidate_timeout_secs,
        "facematchd listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("facematchd shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
