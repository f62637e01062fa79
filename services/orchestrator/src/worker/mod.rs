//! Scheduling workers.
//!
//! Each worker runs `dequeue -> schedule -> apply -> ack` in a loop until
//! shutdown is signaled. Workers share nothing but the store and the broker;
//! two workers holding evaluations for the same job are reconciled by the
//! applier's commit token.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use convoy_events::{EvaluationStatus, EvaluationTrigger};
use convoy_id::{EvaluationId, ReceiptHandle};
use convoy_reconcile::{ExponentialBackoff, DEFAULT_CONFLICT_BACKOFF};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{BrokerError, EvaluationBroker};
use crate::models::{Evaluation, EvaluationReceipt, Job};
use crate::planner::{ApplyError, PlanApplier};
use crate::scheduler::{conflict_followup_id, Scheduler, SchedulerError};
use crate::store::{StateStore, StoreError};

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub count: usize,

    /// How long one dequeue blocks before re-checking for shutdown.
    pub dequeue_timeout: Duration,

    /// Delay before re-evaluating a job after losing a commit race.
    pub conflict_backoff: Duration,

    /// Pause between loop iterations after infrastructure errors.
    pub backoff: ExponentialBackoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            dequeue_timeout: Duration::from_secs(5),
            conflict_backoff: DEFAULT_CONFLICT_BACKOFF,
            backoff: ExponentialBackoff::default(),
        }
    }
}

/// Result type for one unit of worker processing.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Failures that make a worker back off.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("scheduling failed: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("apply failed: {0}")]
    Apply(#[from] ApplyError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

/// How a dequeued evaluation was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Plan applied and evaluation acked as complete.
    Completed,
    /// Lost a commit race; acked as canceled in favor of `followup`.
    Deferred { followup: EvaluationId },
    /// Permanent failure; acked as failed.
    Failed,
    /// Handed back to the broker for redelivery.
    Requeued,
}

/// One scheduling loop.
pub struct Worker {
    id: usize,
    store: Arc<dyn StateStore>,
    broker: Arc<dyn EvaluationBroker>,
    scheduler: Arc<Scheduler>,
    applier: PlanApplier,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: usize,
        store: Arc<dyn StateStore>,
        broker: Arc<dyn EvaluationBroker>,
        scheduler: Arc<Scheduler>,
        config: WorkerConfig,
    ) -> Self {
        let applier = PlanApplier::new(store.clone(), broker.clone());
        Self {
            id,
            store,
            broker,
            scheduler,
            applier,
            config,
        }
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(worker = self.id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        debug!("Starting scheduling worker");
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let dequeued = tokio::select! {
                result = self.broker.dequeue(self.config.dequeue_timeout) => result,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let result = match dequeued {
                Ok(Some(receipt)) => self.process(receipt, &shutdown).await.map(|_| ()),
                Ok(None) => Ok(()),
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = match e {
                        // Disabled broker: idle until it is turned back on.
                        WorkerError::Broker(BrokerError::Disabled) => self.config.dequeue_timeout,
                        _ => {
                            warn!(error = %e, failures, "Worker iteration failed");
                            self.config.backoff.delay(failures)
                        }
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        debug!("Scheduling worker shutting down");
    }

    /// Processes one dequeued evaluation to a settled state.
    ///
    /// Infrastructure errors are returned after the evaluation has been
    /// nacked so the caller can back off.
    #[instrument(
        skip(self, receipt, shutdown),
        fields(
            worker = self.id,
            evaluation_id = %receipt.evaluation.id,
            job_id = %receipt.evaluation.job_id,
            triggered_by = %receipt.evaluation.triggered_by,
        )
    )]
    pub async fn process(
        &self,
        receipt: EvaluationReceipt,
        shutdown: &watch::Receiver<bool>,
    ) -> WorkerResult<Disposition> {
        let EvaluationReceipt {
            evaluation,
            receipt_handle,
        } = receipt;

        if *shutdown.borrow() {
            debug!("Shutdown observed, returning evaluation");
            self.broker.nack(&receipt_handle).await?;
            return Ok(Disposition::Requeued);
        }

        let plan = match self.scheduler.schedule(&evaluation).await {
            Ok(plan) => plan,
            Err(e) if e.is_retryable() => {
                self.broker.nack(&receipt_handle).await?;
                return Err(e.into());
            }
            Err(e) => {
                warn!(error = %e, "Evaluation cannot be scheduled");
                return self
                    .settle(&receipt_handle, &evaluation, EvaluationStatus::Failed, e.to_string())
                    .await
                    .map(|_| Disposition::Failed);
            }
        };

        // Re-arm the lease for the apply. Once redelivered, the evaluation
        // belongs to its new holder.
        match self.broker.extend_lease(&receipt_handle).await {
            Ok(()) => {}
            Err(BrokerError::LeaseExpired(_)) => {
                warn!("Lease expired before apply, leaving evaluation to its redelivery");
                return Ok(Disposition::Requeued);
            }
            Err(e) => return Err(e.into()),
        }

        let job = plan.job.clone();
        match self.applier.apply(plan).await {
            Ok(_) => {
                self.settle(&receipt_handle, &evaluation, EvaluationStatus::Complete, String::new())
                    .await?;
                Ok(Disposition::Completed)
            }
            Err(e) if e.is_conflict() => {
                let followup = match self.conflict_followup(&job, &evaluation).await {
                    Ok(followup) => followup,
                    Err(store_err) => {
                        self.broker.nack(&receipt_handle).await?;
                        return Err(store_err.into());
                    }
                };
                if followup.should_enqueue() {
                    self.broker.enqueue(followup.clone()).await?;
                }
                info!(
                    followup_id = %followup.id,
                    error = %e,
                    "Plan conflicted, deferring to a fresh evaluation"
                );
                self.settle(
                    &receipt_handle,
                    &evaluation,
                    EvaluationStatus::Canceled,
                    format!("plan conflicted; superseded by {}", followup.id),
                )
                .await?;
                Ok(Disposition::Deferred {
                    followup: followup.id,
                })
            }
            Err(e) if e.is_retryable() => {
                self.broker.nack(&receipt_handle).await?;
                Err(e.into())
            }
            Err(e) => {
                error!(error = %e, "Plan could not be applied");
                self.settle(&receipt_handle, &evaluation, EvaluationStatus::Failed, e.to_string())
                    .await
                    .map(|_| Disposition::Failed)
            }
        }
    }

    /// Records the evaluation that retries `evaluation` after a lost commit
    /// race. A redelivered loser gets back the follow-up it created before.
    async fn conflict_followup(&self, job: &Job, evaluation: &Evaluation) -> Result<Evaluation, StoreError> {
        let now = Utc::now();
        let followup = Evaluation::for_job(job, EvaluationTrigger::Defer, now)
            .with_id(conflict_followup_id(evaluation))
            .with_comment(format!("re-evaluation after conflict in {}", evaluation.id))
            .delayed(now, self.config.conflict_backoff);
        match self.store.create_evaluation(followup).await {
            Err(StoreError::EvaluationAlreadyExists(id)) => {
                debug!(followup_id = %id, "Conflict follow-up already recorded");
                self.store.get_evaluation(id).await
            }
            result => result,
        }
    }

    /// Acks the lease and records the final status of the evaluation.
    async fn settle(
        &self,
        handle: &ReceiptHandle,
        evaluation: &Evaluation,
        status: EvaluationStatus,
        comment: String,
    ) -> WorkerResult<()> {
        match self.broker.ack(handle).await {
            Ok(_) => {}
            Err(BrokerError::LeaseExpired(_)) => {
                // Redelivered already; the next attempt settles it.
                warn!(evaluation_id = %evaluation.id, "Lease expired before ack");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match self
            .store
            .update_evaluation_status(evaluation.id, status, comment)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_terminal() || e.is_not_found() => {
                debug!(error = %e, "Evaluation status left unchanged");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Fixed-size pool of scheduling workers.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn EvaluationBroker>,
        scheduler: Arc<Scheduler>,
        config: WorkerConfig,
    ) -> Self {
        let workers = (0..config.count.max(1))
            .map(|id| {
                Arc::new(Worker::new(
                    id,
                    store.clone(),
                    broker.clone(),
                    scheduler.clone(),
                    config.clone(),
                ))
            })
            .collect();
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawns every worker onto the runtime.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> JoinSet<()> {
        info!(workers = self.workers.len(), "Starting scheduling workers");
        let mut set = JoinSet::new();
        for worker in &self.workers {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move { worker.run(shutdown).await });
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, InMemoryBroker};
    use crate::models::{Job, JobSpec, NodeInfo, Resources, Task};
    use crate::nodes::{MergedDirectory, NodeSource};
    use crate::scheduler::SchedulerConfig;
    use crate::store::InMemoryStore;
    use convoy_events::JobType;
    use convoy_id::NodeId;

    struct Fixture {
        store: Arc<InMemoryStore>,
        broker: Arc<InMemoryBroker>,
        worker: Worker,
    }

    fn fixture(nodes: &[&str]) -> Fixture {
        fixture_with(nodes, BrokerConfig::default())
    }

    fn fixture_with(nodes: &[&str], broker_config: BrokerConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new(broker_config));
        let infos = nodes
            .iter()
            .map(|n| {
                NodeInfo::new(
                    NodeId::new(*n).unwrap(),
                    &["docker"],
                    Resources {
                        cpu: 2.0,
                        memory: 2048,
                        disk: 0,
                        gpu: 0,
                    },
                )
            })
            .collect();
        let directory = Arc::new(MergedDirectory::new(vec![NodeSource::Static(infos)]));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            directory,
            SchedulerConfig::default(),
        ));
        let worker = Worker::new(
            0,
            store.clone(),
            broker.clone(),
            scheduler,
            WorkerConfig {
                count: 1,
                dequeue_timeout: Duration::from_millis(50),
                ..WorkerConfig::default()
            },
        );
        Fixture {
            store,
            broker,
            worker,
        }
    }

    async fn register(f: &Fixture, count: u32) -> (Job, Evaluation) {
        let spec = JobSpec::new("job", JobType::Batch, count, Task::new("main", "docker"));
        let job = f.store.create_job(Job::from_spec(spec)).await.unwrap();
        let eval = Evaluation::for_job(&job, EvaluationTrigger::JobRegister, Utc::now());
        let eval = f.store.create_evaluation(eval).await.unwrap();
        f.broker.enqueue(eval.clone()).await.unwrap();
        (job, eval)
    }

    async fn next(f: &Fixture) -> EvaluationReceipt {
        f.broker
            .dequeue(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("evaluation ready")
    }

    #[tokio::test]
    async fn test_process_applies_and_completes() {
        let f = fixture(&["n1"]);
        let (job, eval) = register(&f, 1).await;
        let (_tx, rx) = watch::channel(false);

        let disposition = f.worker.process(next(&f).await, &rx).await.unwrap();
        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(f.store.get_executions(job.id).await.unwrap().len(), 1);
        assert_eq!(
            f.store.get_evaluation(eval.id).await.unwrap().status,
            EvaluationStatus::Complete
        );
        assert_eq!(f.broker.stats().await.total_inflight, 0);
    }

    #[tokio::test]
    async fn test_shutdown_after_dequeue_nacks() {
        let f = fixture(&["n1"]);
        let (job, eval) = register(&f, 1).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let disposition = f.worker.process(next(&f).await, &rx).await.unwrap();
        assert_eq!(disposition, Disposition::Requeued);
        assert!(f.store.get_executions(job.id).await.unwrap().is_empty());
        assert!(f.broker.contains(eval.id).await);
        assert_eq!(
            f.store.get_evaluation(eval.id).await.unwrap().status,
            EvaluationStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_missing_job_fails_evaluation() {
        let f = fixture(&["n1"]);
        let ghost = Job::from_spec(JobSpec::new("ghost", JobType::Batch, 1, Task::new("t", "docker")));
        let eval = f
            .store
            .create_evaluation(Evaluation::for_job(&ghost, EvaluationTrigger::JobRegister, Utc::now()))
            .await
            .unwrap();
        f.broker.enqueue(eval.clone()).await.unwrap();
        let (_tx, rx) = watch::channel(false);

        let disposition = f.worker.process(next(&f).await, &rx).await.unwrap();
        assert_eq!(disposition, Disposition::Failed);
        let stored = f.store.get_evaluation(eval.id).await.unwrap();
        assert_eq!(stored.status, EvaluationStatus::Failed);
        assert!(stored.comment.contains("not found"));
        assert!(!f.broker.contains(eval.id).await);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let f = fixture(&["n1"]);
        let (tx, rx) = watch::channel(false);
        let worker = Arc::new(f.worker);
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker stopped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_skips_apply() {
        let f = fixture_with(
            &["n1"],
            BrokerConfig {
                visibility_timeout: Duration::from_millis(50),
                ..BrokerConfig::default()
            },
        );
        let (job, eval) = register(&f, 1).await;
        let (_tx, rx) = watch::channel(false);

        let stale = next(&f).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        let disposition = f.worker.process(stale, &rx).await.unwrap();
        assert_eq!(disposition, Disposition::Requeued);
        assert!(f.store.get_executions(job.id).await.unwrap().is_empty());
        assert_eq!(
            f.store.get_evaluation(eval.id).await.unwrap().status,
            EvaluationStatus::Pending
        );

        let disposition = f.worker.process(next(&f).await, &rx).await.unwrap();
        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(f.store.get_executions(job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_followup_is_created_once() {
        let f = fixture(&["n1"]);
        let (job, eval) = register(&f, 1).await;

        let first = f.worker.conflict_followup(&job, &eval).await.unwrap();
        let again = f.worker.conflict_followup(&job, &eval).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(first.triggered_by, EvaluationTrigger::Defer);
        assert!(first.wait_until.is_some());
        assert!(first.comment.contains(&eval.id.to_string()));

        let for_job = f
            .store
            .list_evaluations(crate::store::EvaluationQuery::for_job(job.id))
            .await
            .unwrap();
        assert_eq!(for_job.len(), 2);
    }
}
