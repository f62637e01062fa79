//! Scheduler: turns one evaluation into a plan.
//!
//! The scheduler is responsible for:
//! - Loading a snapshot of the job, its executions and the node directory
//! - Deciding which executions to create, stop or link (`Reconciler`)
//! - Deferring work that cannot be placed yet
//!
//! It never writes. Plans are committed by the plan applier.

mod reconciler;
mod selection;

pub use reconciler::Reconciler;
pub(crate) use reconciler::{conflict_followup_id, exceeds_execution_timeout};
pub use selection::{has_capacity, ineligibility, rank_nodes, score};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use convoy_reconcile::{DEFAULT_MAX_RETRIES, DEFAULT_OVERSUBSCRIPTION_FACTOR, DEFAULT_QUEUE_BACKOFF};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::models::{Evaluation, Plan};
use crate::nodes::{DirectoryError, NodeDirectory};
use crate::store::{StateStore, StoreError};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Wait before re-evaluating a job that could not be fully placed.
    pub queue_backoff: Duration,

    /// Failed attempts a job may replace when its task sets no limit.
    pub default_max_retries: u32,

    /// Multiplier applied to node capacity when checking fit.
    pub oversubscription_factor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_backoff: DEFAULT_QUEUE_BACKOFF,
            default_max_retries: DEFAULT_MAX_RETRIES,
            oversubscription_factor: DEFAULT_OVERSUBSCRIPTION_FACTOR,
        }
    }
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur while loading a scheduling snapshot.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("node directory error: {0}")]
    Directory(#[from] DirectoryError),
}

impl SchedulerError {
    /// Worth another delivery of the same evaluation.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::Store(e) => e.is_retryable(),
            SchedulerError::Directory(_) => true,
        }
    }
}

/// Loads snapshots and hands them to the reconciler.
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    nodes: Arc<dyn NodeDirectory>,
    reconciler: Reconciler,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        nodes: Arc<dyn NodeDirectory>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            nodes,
            reconciler: Reconciler::new(config),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Computes the plan for `evaluation` against the current state.
    #[instrument(
        skip(self, evaluation),
        fields(evaluation_id = %evaluation.id, job_id = %evaluation.job_id)
    )]
    pub async fn schedule(&self, evaluation: &Evaluation) -> SchedulerResult<Plan> {
        let job = self.store.get_job(evaluation.job_id).await?;
        let executions = self.store.get_executions(job.id).await?;
        // A terminal job only needs its executions stopped.
        let nodes = if job.is_terminal() {
            Vec::new()
        } else {
            self.nodes.list_nodes().await?
        };

        let plan = self
            .reconciler
            .reconcile(evaluation, &job, &executions, &nodes, Utc::now());
        debug!(
            new_executions = plan.new_executions.len(),
            updated_executions = plan.updated_executions.len(),
            new_evaluations = plan.new_evaluations.len(),
            job_state = ?plan.desired_job_state.as_ref().map(|s| s.state_type),
            fingerprint = %plan
                .fingerprint()
                .map_or_else(|e| format!("unavailable: {e}"), |f| f.to_string()),
            "Plan computed"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, JobSpec, NodeInfo, Resources, Task};
    use crate::nodes::{MergedDirectory, NodeSource};
    use crate::store::InMemoryStore;
    use convoy_events::{EvaluationTrigger, JobType};
    use convoy_id::NodeId;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_plan_fingerprint_is_logged() {
        let store = Arc::new(InMemoryStore::new());
        let node = NodeInfo::new(
            NodeId::new("n1").unwrap(),
            &["docker"],
            Resources {
                cpu: 2.0,
                memory: 2048,
                disk: 0,
                gpu: 0,
            },
        );
        let directory = Arc::new(MergedDirectory::new(vec![NodeSource::Static(vec![node])]));
        let scheduler = Scheduler::new(store.clone(), directory, SchedulerConfig::default());
        let spec = JobSpec::new("job", JobType::Batch, 1, Task::new("main", "docker"));
        let job = store.create_job(Job::from_spec(spec)).await.unwrap();
        let evaluation = Evaluation::for_job(&job, EvaluationTrigger::JobRegister, Utc::now());

        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer({
                let captured = captured.clone();
                move || captured.clone()
            })
            .finish();
        let plan = {
            let _guard = tracing::subscriber::set_default(subscriber);
            scheduler.schedule(&evaluation).await.unwrap()
        };

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let fingerprint = plan.fingerprint().unwrap();
        assert!(
            logs.contains(&format!("fingerprint={fingerprint}")),
            "{logs}"
        );
    }
}
