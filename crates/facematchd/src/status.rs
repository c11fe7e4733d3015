//! SQLite-backed status-check log.
//!
//! Schema:
//! - status_checks: id (UUID v4), client_name, timestamp (RFC 3339, UTC)

use chrono::{DateTime, Utc};
use rusqlite::params;
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS status_checks (
    id TEXT PRIMARY KEY,
    client_name TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
";

/// Maximum number of entries returned by a listing.
pub const MAX_LISTED: usize = 1000;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCheck {
    pub id: String,
    pub client_name: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusCheck {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client_name: client_name.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusCheckCreate {
    pub client_name: String,
}

/// Handle to the status-check database. Cheap to clone.
#[derive(Clone)]
pub struct StatusStore {
    conn: Connection,
}

impl StatusStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "status store opened");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Record a new status check for `client_name`.
    pub async fn record(&self, client_name: impl Into<String>) -> Result<StatusCheck, StoreError> {
        let check = StatusCheck::new(client_name);
        let row = check.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO status_checks (id, client_name, timestamp) VALUES (?1, ?2, ?3)",
                    params![row.id, row.client_name, row.timestamp.to_rfc3339()],
                )?;
                Ok(())
            })
            .await?;
        tracing::debug!(id = %check.id, client = %check.client_name, "status check recorded");
        Ok(check)
    }

    /// Status checks in insertion order, at most `limit` of them.
    pub async fn list(&self, limit: usize) -> Result<Vec<StatusCheck>, StoreError> {
        let limit = limit.min(i64::MAX as usize) as i64;
        let checks = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, client_name, timestamp FROM status_checks ORDER BY rowid LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], |row| {
                    let raw: String = row.get(2)?;
                    let timestamp = DateTime::parse_from_rfc3339(&raw)
                        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?
                        .with_timezone(&Utc);
                    Ok(StatusCheck {
                        id: row.get(0)?,
                        client_name: row.get(1)?,
                        timestamp,
                    })
                })?;
                let checks = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(checks)
            })
            .await?;
        Ok(checks)
    }
}
