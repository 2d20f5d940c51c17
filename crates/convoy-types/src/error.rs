//! Error types for shared Convoy types.

use thiserror::Error;

/// Result type alias using the shared types error.
pub type Result<T> = std::result::Result<T, TypesError>;

/// Errors raised while parsing identity and message types.
#[derive(Debug, Error)]
pub enum TypesError {
    #[error("unknown instance type: {0}")]
    UnknownInstanceType(String),

    #[error("unknown instance role: {0}")]
    UnknownInstanceRole(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
