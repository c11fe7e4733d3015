//! facematchd — HTTP face comparison service.
//!
//! Routes:
//! - `GET /api/`: service banner
//! - `POST /api/status`, `GET /api/status`: status-check log
//! - `POST /api/compare-faces`: multipart batch comparison

pub mod config;
pub mod server;
pub mod status;

pub use config::{Config, CorsOrigins};
pub use server::{build_router, start_server, ApiError, AppState};
pub use status::{StatusCheck, StatusStore, StoreError};
