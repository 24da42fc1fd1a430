//! Error types for ratelock.

use thiserror::Error;

use crate::ratelimit::AdjustError;

/// Main error type for ratelock operations.
#[derive(Error, Debug)]
pub enum RateLockError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wait limit adjustment errors
    #[error("Adjustment error: {0}")]
    Adjust(#[from] AdjustError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ratelock operations.
pub type Result<T> = std::result::Result<T, RateLockError>;
