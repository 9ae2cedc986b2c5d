//! Error types for ratewindow.

use thiserror::Error;

/// Main error type for ratewindow operations.
#[derive(Error, Debug)]
pub enum RateWindowError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store failures (backend unavailable, write rejected, ...)
    #[error("Counter store error: {0}")]
    Store(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ratewindow operations.
pub type Result<T> = std::result::Result<T, RateWindowError>;
