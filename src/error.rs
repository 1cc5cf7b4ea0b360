//! Error types for the Turnstile engine.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid limit policy or service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid request input, such as an empty identifier or route
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store errors surfaced on administrative paths
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
