use thiserror::Error;

/// Why a string could not be turned into an identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    /// Well-formed, but for another kind of record (`exec_...` where a job
    /// ID was expected).
    #[error("wrong ID kind: expected '{expected}_...', got '{actual}_...'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("ID has no '_' between kind and ULID")]
    MissingSeparator,

    #[error("malformed ULID: {0}")]
    InvalidUlid(String),

    #[error("invalid node ID '{0}': must be non-empty and contain no whitespace or '/'")]
    InvalidNodeId(String),

    #[error("invalid receipt handle: {0}")]
    InvalidReceiptHandle(String),
}
