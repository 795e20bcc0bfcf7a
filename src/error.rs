//! Error types for the Ratewarden limiter.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Caller supplied a quota or window that cannot be enforced
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Window store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A window store could not answer.
///
/// Every variant means the same thing to the limiter: the store is
/// unavailable and the request must be served from the local fallback.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend refused or dropped the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within the configured deadline
    #[error("store timed out after {0:?}")]
    Timeout(Duration),

    /// Redis protocol, connection or transaction errors
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
