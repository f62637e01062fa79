//! State store error types.

use convoy_events::{EvaluationStatus, ExecutionStateType, JobStateType};
use convoy_id::{EvaluationId, ExecutionId, JobId, NodeId};
use thiserror::Error;

/// State store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("evaluation not found: {0}")]
    EvaluationNotFound(EvaluationId),

    #[error("job already exists: {0}")]
    JobAlreadyExists(JobId),

    #[error("execution already exists: {0}")]
    ExecutionAlreadyExists(ExecutionId),

    #[error("evaluation already exists: {0}")]
    EvaluationAlreadyExists(EvaluationId),

    /// Optimistic concurrency mismatch on a job.
    #[error("job {job_id} changed concurrently: {reason}")]
    JobConflict { job_id: JobId, reason: String },

    /// Optimistic concurrency mismatch on an execution.
    #[error("execution {execution_id} changed concurrently: {reason}")]
    ExecutionConflict {
        execution_id: ExecutionId,
        reason: String,
    },

    /// Another execution of the job is still live on the node.
    #[error("job {job_id} already has live execution {existing} on node {node_id}")]
    LiveExecutionExists {
        job_id: JobId,
        node_id: NodeId,
        existing: ExecutionId,
    },

    #[error("job {job_id} is already terminal ({state})")]
    JobAlreadyTerminal { job_id: JobId, state: JobStateType },

    #[error("execution {execution_id} is already terminal ({state})")]
    ExecutionAlreadyTerminal {
        execution_id: ExecutionId,
        state: ExecutionStateType,
    },

    #[error("evaluation {evaluation_id} is already terminal ({status})")]
    EvaluationAlreadyTerminal {
        evaluation_id: EvaluationId,
        status: EvaluationStatus,
    },

    #[error("job cannot move from {from} to {to}")]
    InvalidJobTransition { from: JobStateType, to: JobStateType },

    /// Orchestrator writing compute state, or a node writing desired state.
    #[error("{actor} may not write {field}")]
    ActorNotPermitted {
        actor: &'static str,
        field: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    Decode(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Expected revision or state did not match. Resolved by re-scheduling.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::JobConflict { .. }
                | StoreError::ExecutionConflict { .. }
                | StoreError::LiveExecutionExists { .. }
        )
    }

    pub fn is_already_terminal(&self) -> bool {
        matches!(
            self,
            StoreError::JobAlreadyTerminal { .. }
                | StoreError::ExecutionAlreadyTerminal { .. }
                | StoreError::EvaluationAlreadyTerminal { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::JobNotFound(_)
                | StoreError::ExecutionNotFound(_)
                | StoreError::EvaluationNotFound(_)
        )
    }

    /// Infrastructure failures worth retrying after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connect(_) | StoreError::Query(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
