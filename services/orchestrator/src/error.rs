//! Error type for the orchestrator surface.
//!
//! Each layer keeps its own `thiserror` enum. Triggers and API handlers fold
//! them into one tagged [`Error`] whose flags are fixed at construction, so
//! callers never re-derive retry semantics from message text.

use std::fmt;

use convoy_id::IdError;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::models::JobSpecError;
use crate::nodes::DirectoryError;
use crate::store::StoreError;

/// Broad category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    /// Expected state or revision did not match.
    Conflict,
    /// The record is terminal and can no longer change.
    AlreadyTerminal,
    InvalidRequest,
    /// Store or broker temporarily unreachable.
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Conflict => "conflict",
            ErrorKind::AlreadyTerminal => "already_terminal",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    hint: Option<String>,
    retryable: bool,
    /// Whether the execution this error occurred for should be failed.
    fails_execution: bool,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: None,
            retryable: false,
            fails_execution: false,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(ErrorKind::Conflict, message)
        }
    }

    pub fn already_terminal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyTerminal, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(ErrorKind::Unavailable, message)
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn failing_execution(mut self) -> Self {
        self.fails_execution = true;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn fails_execution(&self) -> bool {
        self.fails_execution
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match &err {
            StoreError::JobNotFound(_)
            | StoreError::ExecutionNotFound(_)
            | StoreError::EvaluationNotFound(_) => Error::not_found(message),
            StoreError::JobAlreadyExists(_)
            | StoreError::ExecutionAlreadyExists(_)
            | StoreError::EvaluationAlreadyExists(_) => Error::already_exists(message),
            StoreError::JobConflict { .. } | StoreError::ExecutionConflict { .. } => {
                Error::conflict(message).with_hint("re-read the record and retry")
            }
            StoreError::LiveExecutionExists { .. } => Error::conflict(message),
            StoreError::JobAlreadyTerminal { .. }
            | StoreError::ExecutionAlreadyTerminal { .. }
            | StoreError::EvaluationAlreadyTerminal { .. } => Error::already_terminal(message),
            StoreError::InvalidJobTransition { .. } => Error::conflict(message),
            StoreError::ActorNotPermitted { .. } | StoreError::InvalidRequest(_) => {
                Error::invalid(message)
            }
            StoreError::Connect(_) | StoreError::Query(_) => {
                Error::unavailable(message).with_hint("the state store is unreachable")
            }
            StoreError::Migration(_)
            | StoreError::MigrationDirNotFound { .. }
            | StoreError::Decode(_)
            | StoreError::Serialization(_) => Error::internal(message),
        }
    }
}

impl From<JobSpecError> for Error {
    fn from(err: JobSpecError) -> Self {
        Error::invalid(format!("invalid job: {err}")).failing_execution()
    }
}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Disabled => Error::unavailable(err.to_string())
                .with_hint("the evaluation broker is disabled"),
            BrokerError::NotEnqueueable { .. } => Error::invalid(err.to_string()),
            BrokerError::NotInflight(_) | BrokerError::LeaseExpired(_) => {
                Error::conflict(err.to_string())
            }
        }
    }
}

impl From<DirectoryError> for Error {
    fn from(err: DirectoryError) -> Self {
        Error::unavailable(err.to_string())
            .with_hint("set CONVOY_IGNORE_NODE_SOURCE_ERRORS to skip failing node sources")
    }
}

impl From<IdError> for Error {
    fn from(err: IdError) -> Self {
        Error::invalid(err.to_string())
    }
}
