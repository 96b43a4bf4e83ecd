//! Error types for Bulwark.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Bulwark operations.
///
/// The limiter itself never returns this for store failures (those fail
/// open); it surfaces from configuration loading and store construction.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit configuration violated its invariants
    #[error("Invalid rate limit configuration: {0}")]
    InvalidLimit(String),

    /// Shared store errors (connection setup, not per-check failures)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for BulwarkError {
    fn from(err: config::ConfigError) -> Self {
        BulwarkError::Config(err.to_string())
    }
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;
