//! Error types for gum-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum GumError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Unknown value type: {0}")]
    UnknownValueType(String),

    #[error("Message parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, GumError>;
