//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire structures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A timestamp was negative, not finite, or out of range.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A payload did not have the expected shape.
    #[error("invalid payload for record {id}: {message}")]
    InvalidPayload {
        /// Envelope ID of the offending record.
        id: String,
        /// What was wrong.
        message: String,
    },
}

impl ProtocolError {
    /// Creates an invalid payload error.
    pub fn invalid_payload(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            id: id.into(),
            message: message.into(),
        }
    }
}
