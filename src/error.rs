//! Error types for Ratekeeper.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RateKeeperError {
    /// A limiter was constructed with a non-positive or non-finite parameter
    #[error("Invalid limiter configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter class was requested that is not configured
    #[error("Unknown limiter class: {0}")]
    UnknownClass(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RateKeeperError>;
