//! Error types for store and dispatch operations.

use thiserror::Error;

/// Errors raised by job/queue store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors raised while dispatching a queue.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Queue '{0}' does not exist")]
    UnknownQueue(String),

    #[error("invalid dispatch options: {0}")]
    InvalidOptions(String),

    #[error("invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker pool closed before the run completed")]
    PoolClosed,
}

/// Failure raised by a delivery service while processing a job.
///
/// Returning this is a normal per-job outcome, not a fault of the run: the
/// message becomes the job's transport status message and the retry policy
/// decides what happens next.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProcessError {
    message: String,
}

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
