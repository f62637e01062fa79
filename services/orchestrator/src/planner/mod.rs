//! Plan applier: commits a scheduler plan with optimistic concurrency.
//!
//! The job update runs first and carries the state and revision the plan was
//! computed against. It is the commit token for the whole plan: if another
//! worker committed a plan for the same job in the meantime, nothing of this
//! plan is written. Execution writes are conditional on their own revisions;
//! their conflicts do not stop the rest of the plan but are reported once
//! everything else has been attempted.

use std::sync::Arc;

use convoy_events::{topics, Event};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::broker::{BrokerError, EvaluationBroker};
use crate::models::{Job, Plan};
use crate::store::{
    Actor, ExecutionCondition, JobCondition, StateStore, StoreError, UpdateExecutionRequest,
    UpdateJobStateRequest,
};

/// Result type for plan application.
pub type ApplyResult<T> = Result<T, ApplyError>;

/// Errors that can occur while applying a plan.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The plan was computed against state that has since changed.
    #[error("plan conflicts with current state: {}", describe(.0))]
    Conflict(Vec<StoreError>),

    #[error("state store error: {0}")]
    Store(#[source] StoreError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

fn describe(errors: &[StoreError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ApplyError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApplyError::Conflict(_))
    }

    /// Infrastructure failures; the evaluation should be redelivered.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApplyError::Conflict(_) => false,
            ApplyError::Store(e) => e.is_retryable(),
            ApplyError::Broker(_) => true,
        }
    }
}

/// What an apply wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    /// The job after the commit token, when one was written.
    pub job: Option<Job>,
    /// The job turned terminal since the snapshot; nothing was written.
    pub job_already_terminal: bool,
    pub executions_created: usize,
    /// New executions found already persisted by an earlier attempt.
    pub executions_already_present: usize,
    pub executions_updated: usize,
    /// Updates skipped because the execution had already finished.
    pub executions_skipped: usize,
    pub evaluations_created: usize,
}

/// Commits plans into the store and hands follow-up evaluations to the broker.
#[derive(Clone)]
pub struct PlanApplier {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn EvaluationBroker>,
}

impl PlanApplier {
    pub fn new(store: Arc<dyn StateStore>, broker: Arc<dyn EvaluationBroker>) -> Self {
        Self { store, broker }
    }

    /// Applies `plan`.
    #[instrument(
        skip(self, plan),
        fields(evaluation_id = %plan.evaluation.id, job_id = %plan.job.id)
    )]
    pub async fn apply(&self, plan: Plan) -> ApplyResult<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        if plan.is_empty() {
            debug!("Empty plan, nothing to apply");
            return Ok(outcome);
        }

        if !plan.job.is_terminal() {
            let request = UpdateJobStateRequest {
                job_id: plan.job.id,
                new_state: plan.target_job_state(),
                condition: JobCondition {
                    expected_state: Some(plan.job.state.state_type),
                    expected_revision: Some(plan.job.revision),
                },
                events: plan.job_events.clone(),
            };
            match self.store.update_job_state(request).await {
                Ok(job) => outcome.job = Some(job),
                Err(e) if e.is_conflict() => {
                    info!(error = %e, "Plan lost the race for its job");
                    return Err(ApplyError::Conflict(vec![e]));
                }
                Err(e) if e.is_already_terminal() => {
                    info!(error = %e, "Job finished since the plan was computed");
                    outcome.job_already_terminal = true;
                    return Ok(outcome);
                }
                Err(e) => return Err(ApplyError::Store(e)),
            }
        }

        let mut conflicts = Vec::new();

        for execution in plan.new_executions {
            let execution_id = execution.id;
            let event = plan
                .execution_events
                .get(&execution_id)
                .cloned()
                .unwrap_or_else(|| Event::new(topics::SCHEDULING).with_message("execution placed"));
            match self.store.create_execution(execution, event).await {
                Ok(_) => outcome.executions_created += 1,
                Err(StoreError::ExecutionAlreadyExists(id)) => {
                    debug!(execution_id = %id, "Execution already persisted");
                    outcome.executions_already_present += 1;
                }
                Err(e) if e.is_conflict() => {
                    info!(execution_id = %execution_id, error = %e, "Execution create conflicted");
                    conflicts.push(e);
                }
                Err(e) => return Err(ApplyError::Store(e)),
            }
        }

        for (execution_id, update) in plan.updated_executions {
            let request = UpdateExecutionRequest {
                execution_id,
                actor: Actor::Orchestrator,
                changes: update.changes(),
                condition: ExecutionCondition::at_revision(update.expected_revision),
                event: update.event,
            };
            match self.store.update_execution(request).await {
                Ok(_) => outcome.executions_updated += 1,
                Err(e) if e.is_already_terminal() => {
                    debug!(execution_id = %execution_id, error = %e, "Skipping finished execution");
                    outcome.executions_skipped += 1;
                }
                Err(e) if e.is_conflict() => {
                    info!(execution_id = %execution_id, error = %e, "Execution update conflicted");
                    conflicts.push(e);
                }
                Err(e) => return Err(ApplyError::Store(e)),
            }
        }

        for evaluation in plan.new_evaluations {
            let evaluation = match self.store.create_evaluation(evaluation).await {
                Ok(created) => {
                    outcome.evaluations_created += 1;
                    created
                }
                Err(StoreError::EvaluationAlreadyExists(id)) => self
                    .store
                    .get_evaluation(id)
                    .await
                    .map_err(ApplyError::Store)?,
                Err(e) => return Err(ApplyError::Store(e)),
            };
            if evaluation.should_enqueue() {
                self.broker.enqueue(evaluation).await?;
            }
        }

        if !conflicts.is_empty() {
            info!(conflicts = conflicts.len(), "Plan applied with conflicts");
            return Err(ApplyError::Conflict(conflicts));
        }

        debug!(
            created = outcome.executions_created,
            already_present = outcome.executions_already_present,
            updated = outcome.executions_updated,
            skipped = outcome.executions_skipped,
            evaluations = outcome.evaluations_created,
            "Plan applied"
        );
        Ok(outcome)
    }
}
