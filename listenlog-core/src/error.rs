use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // Configuration errors
    #[error("Config file not found at {path}. A template has been created - please edit it with your Spotify credentials and restart.")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid config: {message}")]
    ConfigInvalid { message: String },

    #[error("Missing required config field: {field}")]
    ConfigMissingField { field: String },

    #[error("Failed to parse config file: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    // Upstream (music source) errors
    #[error("No valid session for music source")]
    NotAuthenticated,

    #[error("Upstream call to {operation} timed out after {timeout_ms}ms")]
    UpstreamTimeout { operation: String, timeout_ms: u64 },

    #[error("Upstream {source_name} failed: {reason}")]
    Upstream { source_name: String, reason: String },

    // Storage errors
    #[error("Unique index violated on {table}; upserts should never conflict")]
    StorageConflict { table: String },

    #[error("Database error: {0}")]
    Database(tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Ephemeral cache error: {reason}")]
    Cache { reason: String },

    // Scheduling errors
    #[error("Scheduler error for job {job_id}: {reason}")]
    Scheduler { job_id: String, reason: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CoreError {
    /// Whether the error is an expected steady state rather than a failure.
    #[must_use]
    pub const fn is_soft(&self) -> bool {
        matches!(self, Self::NotAuthenticated | Self::UpstreamTimeout { .. })
    }
}

fn conflict_table(err: &rusqlite::Error) -> Option<String> {
    match err {
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Some(message.clone().unwrap_or_else(|| "unknown".to_string()))
        }
        _ => None,
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        match conflict_table(&err) {
            Some(table) => Self::StorageConflict { table },
            None => Self::Sqlite(err),
        }
    }
}

impl From<tokio_rusqlite::Error> for CoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(inner) => inner.into(),
            other => Self::Database(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
