//! Error types shared by the roadworks crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared plumbing
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Missing secret: {0}")]
    MissingSecret(String),

    #[error("Invalid secret {name}: {reason}")]
    InvalidSecret { name: String, reason: String },
}
