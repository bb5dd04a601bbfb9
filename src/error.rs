//! Error types for jobq.

use thiserror::Error;

use crate::model::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    /// Absent, or owned by someone else. The two are indistinguishable.
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("cannot {operation} a job in state {status}")]
    InvalidState {
        status: JobStatus,
        operation: &'static str,
    },

    #[error("invalid submission: {0}")]
    Validation(String),

    #[error("dispatch queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
