//! Durable state for jobs, executions, evaluations and job history.
//!
//! This module provides:
//! - The `StateStore` contract used by the scheduler, applier and triggers
//! - An in-memory implementation for tests and single-process deployments
//! - A Postgres implementation (SQLx) with migrations
//!
//! Every conditional write is an indivisible check-and-set: it either applies
//! completely, bumps the revision by one and appends history, or fails with a
//! typed error and leaves the record untouched.

mod error;
mod memory;
mod postgres;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use postgres::{DbConfig, PostgresStore};

use async_trait::async_trait;
use convoy_events::{
    Event, EvaluationStatus, ExecutionStateType, HistoryQuery, JobHistory, JobStateType, State,
};
use convoy_id::{EvaluationId, ExecutionId, JobId};

use crate::models::{Evaluation, Execution, ExecutionChanges, Job};

// =============================================================================
// Requests
// =============================================================================

/// Who is writing an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Scheduler and triggers; may write desired state and bookkeeping.
    Orchestrator,
    /// The compute node; may write compute state only.
    Node,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Orchestrator => "orchestrator",
            Actor::Node => "node",
        }
    }
}

/// Preconditions for a job update. Unset fields are not checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCondition {
    pub expected_state: Option<JobStateType>,
    pub expected_revision: Option<u64>,
}

impl JobCondition {
    pub(crate) fn check(&self, job: &Job) -> StoreResult<()> {
        if let Some(expected) = self.expected_state {
            if job.state.state_type != expected {
                return Err(StoreError::JobConflict {
                    job_id: job.id,
                    reason: format!("expected state {expected}, found {}", job.state.state_type),
                });
            }
        }
        if let Some(expected) = self.expected_revision {
            if job.revision != expected {
                return Err(StoreError::JobConflict {
                    job_id: job.id,
                    reason: format!("expected revision {expected}, found {}", job.revision),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UpdateJobStateRequest {
    pub job_id: JobId,
    pub new_state: State<JobStateType>,
    pub condition: JobCondition,
    /// One job-level history record is written per event.
    pub events: Vec<Event>,
}

/// Preconditions for an execution update. Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionCondition {
    /// The current compute state must be one of these.
    pub expected_states: Vec<ExecutionStateType>,
    pub expected_revision: Option<u64>,
}

impl ExecutionCondition {
    pub fn at_revision(revision: u64) -> Self {
        Self {
            expected_states: Vec::new(),
            expected_revision: Some(revision),
        }
    }

    pub(crate) fn check(&self, execution: &Execution) -> StoreResult<()> {
        let current = execution.compute_state.state_type;
        if !self.expected_states.is_empty() && !self.expected_states.contains(&current) {
            return Err(StoreError::ExecutionConflict {
                execution_id: execution.id,
                reason: format!("unexpected compute state {current}"),
            });
        }
        if let Some(expected) = self.expected_revision {
            if execution.revision != expected {
                return Err(StoreError::ExecutionConflict {
                    execution_id: execution.id,
                    reason: format!(
                        "expected revision {expected}, found {}",
                        execution.revision
                    ),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UpdateExecutionRequest {
    pub execution_id: ExecutionId,
    pub actor: Actor,
    pub changes: ExecutionChanges,
    pub condition: ExecutionCondition,
    pub event: Event,
}

impl UpdateExecutionRequest {
    /// Rejects writes to the other actor's field and writes to frozen state.
    pub(crate) fn check(&self, execution: &Execution) -> StoreResult<()> {
        match self.actor {
            Actor::Orchestrator if self.changes.compute_state.is_some() => {
                return Err(StoreError::ActorNotPermitted {
                    actor: Actor::Orchestrator.as_str(),
                    field: "compute state",
                })
            }
            Actor::Node if self.changes.desired_state.is_some() => {
                return Err(StoreError::ActorNotPermitted {
                    actor: Actor::Node.as_str(),
                    field: "desired state",
                })
            }
            _ => {}
        }
        if self.changes.is_empty() {
            return Err(StoreError::InvalidRequest("execution update changes nothing".into()));
        }

        if !self.changes.is_bookkeeping_only() && execution.is_terminal_compute_state() {
            return Err(StoreError::ExecutionAlreadyTerminal {
                execution_id: execution.id,
                state: execution.compute_state.state_type,
            });
        }
        // A stop request is final for the orchestrator; the node still reports
        // how the execution ended.
        if self.changes.desired_state.is_some() && execution.is_terminal_desired_state() {
            return Err(StoreError::ExecutionAlreadyTerminal {
                execution_id: execution.id,
                state: execution.compute_state.state_type,
            });
        }

        self.condition.check(execution)
    }
}

/// Filters for listing evaluations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationQuery {
    pub status: Option<EvaluationStatus>,
    pub job_id: Option<JobId>,
}

impl EvaluationQuery {
    pub fn with_status(status: EvaluationStatus) -> Self {
        Self {
            status: Some(status),
            job_id: None,
        }
    }

    pub fn for_job(job_id: JobId) -> Self {
        Self {
            status: None,
            job_id: Some(job_id),
        }
    }

    pub(crate) fn matches(&self, evaluation: &Evaluation) -> bool {
        self.status.is_none_or(|s| evaluation.status == s)
            && self.job_id.is_none_or(|j| evaluation.job_id == j)
    }
}

// =============================================================================
// StateStore
// =============================================================================

/// Storage contract of the scheduling core.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persists a new job as Pending with revision 1 and version 1.
    async fn create_job(&self, job: Job) -> StoreResult<Job>;

    async fn get_job(&self, job_id: JobId) -> StoreResult<Job>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> StoreResult<Vec<Job>>;

    /// Jobs that are not terminal, oldest first.
    async fn list_in_progress_jobs(&self) -> StoreResult<Vec<Job>>;

    /// Conditionally changes a job's state. Bumps the revision even if the
    /// state type does not change.
    async fn update_job_state(&self, request: UpdateJobStateRequest) -> StoreResult<Job>;

    /// Persists a new execution with revision 1.
    async fn create_execution(&self, execution: Execution, event: Event) -> StoreResult<Execution>;

    async fn get_execution(&self, execution_id: ExecutionId) -> StoreResult<Execution>;

    /// Executions of a job, oldest first.
    async fn get_executions(&self, job_id: JobId) -> StoreResult<Vec<Execution>>;

    async fn update_execution(&self, request: UpdateExecutionRequest) -> StoreResult<Execution>;

    async fn create_evaluation(&self, evaluation: Evaluation) -> StoreResult<Evaluation>;

    async fn get_evaluation(&self, evaluation_id: EvaluationId) -> StoreResult<Evaluation>;

    /// Evaluations matching `query`, oldest first.
    async fn list_evaluations(&self, query: EvaluationQuery) -> StoreResult<Vec<Evaluation>>;

    /// Moves an evaluation to `status`. Terminal evaluations are frozen.
    async fn update_evaluation_status(
        &self,
        evaluation_id: EvaluationId,
        status: EvaluationStatus,
        comment: String,
    ) -> StoreResult<Evaluation>;

    /// History of a job ordered by occurrence time.
    async fn get_job_history(
        &self,
        job_id: JobId,
        query: &HistoryQuery,
    ) -> StoreResult<Vec<JobHistory>>;
}

/// Rejects job transitions that would leave a terminal state or go backwards.
pub(crate) fn check_job_transition(job: &Job, next: JobStateType) -> StoreResult<()> {
    let current = job.state.state_type;
    if current.is_terminal() {
        return Err(StoreError::JobAlreadyTerminal {
            job_id: job.id,
            state: current,
        });
    }
    if !current.can_transition_to(next) {
        return Err(StoreError::InvalidJobTransition {
            from: current,
            to: next,
        });
    }
    Ok(())
}
