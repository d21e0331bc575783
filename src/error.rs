//! Application error types

use thiserror::Error;

/// Application-wide error type.
///
/// The first four variants are the propagation-relevant kinds: callers
/// branch on them to decide between pausing a job, retrying with backoff,
/// dropping a frame, or stopping a worker.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    #[error("retryable: {0}")]
    Retryable(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Whether the caller may retry the failed operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Retryable(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
