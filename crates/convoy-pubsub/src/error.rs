//! Error types for fleet pub/sub operations.

use thiserror::Error;

/// Result type for pub/sub operations.
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Error type for pub/sub operations.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// Scaling mode is on but no transport connection exists.
    #[error("pub/sub transport is not connected")]
    NotConnected,

    /// The broker connection failed or rejected an operation.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PubSubError {
    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

impl From<redis::RedisError> for PubSubError {
    fn from(err: redis::RedisError) -> Self {
        Self::Transport(err.to_string())
    }
}
