//! Error types for state and event decoding.

use thiserror::Error;

/// Errors that can occur when decoding states or events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A stored or submitted state name is not part of the vocabulary.
    #[error("unknown {kind} '{value}'")]
    UnknownState { kind: &'static str, value: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
