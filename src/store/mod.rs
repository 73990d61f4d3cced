//! Durable task/attempt storage.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{SecondsFormat, Utc};
use thiserror::Error;

use crate::api::ParseEnumError;
use crate::paths::PathError;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row does not exist.
    #[error("not found")]
    NotFound,

    /// Another attempt is already in flight for this task.
    #[error("attempt in progress")]
    InProgress,

    /// Task id or derived path failed validation.
    #[error(transparent)]
    Path(#[from] PathError),

    /// A persisted enum column held an unknown value.
    #[error(transparent)]
    Corrupt(#[from] ParseEnumError),

    /// Underlying database failure.
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Transient lock contention, worth retrying with backoff.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Database(err) => {
                let msg = err.to_string();
                msg.contains("database is locked")
                    || msg.contains("database is busy")
                    || msg.contains("SQLITE_BUSY")
            }
            _ => false,
        }
    }
}

/// Result of a successful [`SqliteStore::start_attempt`] claim.
#[derive(Debug, Clone)]
pub struct StartedAttempt {
    pub attempt_id: i64,
    /// Repo-relative artifacts dir for this attempt.
    pub artifacts_dir: String,
    pub attempt_num: i64,
    pub started_at: String,
}

/// Current UTC time as nanosecond-precision RFC 3339.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}
