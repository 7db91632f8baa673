use thiserror::Error;

use crate::types::JobStatus;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid job transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Lease no longer held: {0}")]
    LeaseLost(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Errors that originate in an external collaborator (store, broker)
    /// rather than in the request itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ScanError::StorageUnavailable(_) | ScanError::Io(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for ScanError {
    fn from(err: redis::RedisError) -> Self {
        ScanError::StorageUnavailable(format!("redis: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
