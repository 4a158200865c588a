//! Error types for message handling.

use thiserror::Error;

/// Errors that can occur when encoding or decoding bus payloads.
#[derive(Debug, Error, Clone)]
pub enum MessageError {
    /// An inbound payload could not be decoded.
    #[error("malformed message on '{subject}': {reason}")]
    Malformed { subject: String, reason: String },

    /// A payload failed a semantic check after decoding.
    #[error("invalid message: {0}")]
    Invalid(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        MessageError::Serialization(err.to_string())
    }
}
