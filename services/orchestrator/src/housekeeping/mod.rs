//! Housekeeping: periodic self-repair.
//!
//! Each pass:
//! 1. Marks registry nodes without recent heartbeats as disconnected
//! 2. Persists dead-lettered evaluations as failed
//! 3. Re-enqueues pending evaluations the broker lost track of
//! 4. Injects one corrective evaluation per job that needs attention:
//!    an execution past its timeout, an execution on a departed node, or no
//!    activity at all within the housekeeping window
//!
//! Job inspection runs concurrently, bounded by a semaphore.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use convoy_events::{EvaluationStatus, EvaluationTrigger};
use convoy_id::NodeId;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{BrokerError, EvaluationBroker};
use crate::models::{from_nanos, Evaluation, Job, NodeInfo};
use crate::nodes::{NodeDirectory, NodeRegistry};
use crate::scheduler::exceeds_execution_timeout;
use crate::store::{EvaluationQuery, StateStore, StoreError};

/// Housekeeping configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HousekeepingConfig {
    /// Time between passes.
    pub interval: Duration,

    /// Age after which pending evaluations and idle jobs are considered stuck.
    pub timeout: Duration,

    /// Grace added to task execution timeouts, so nodes report their own
    /// timeouts first.
    pub execution_timeout_buffer: Duration,

    /// Jobs inspected concurrently.
    pub workers: usize,

    /// Registry nodes silent for this long are marked disconnected.
    pub node_heartbeat_timeout: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(120),
            execution_timeout_buffer: Duration::from_secs(60),
            workers: 3,
            node_heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

pub type HousekeepingResult<T> = Result<T, HousekeepingError>;

#[derive(Debug, Error)]
pub enum HousekeepingError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HousekeepingReport {
    pub nodes_expired: Vec<NodeId>,
    /// Dead-lettered evaluations persisted as failed.
    pub dead_failed: usize,
    /// Pending evaluations handed back to the broker.
    pub requeued: usize,
    /// Corrective evaluations created, at most one per job.
    pub corrective: Vec<Evaluation>,
}

impl HousekeepingReport {
    pub fn is_quiet(&self) -> bool {
        self.nodes_expired.is_empty()
            && self.dead_failed == 0
            && self.requeued == 0
            && self.corrective.is_empty()
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// The periodic self-repair task.
#[derive(Clone)]
pub struct Housekeeping {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn EvaluationBroker>,
    nodes: Arc<dyn NodeDirectory>,
    registry: Option<Arc<NodeRegistry>>,
    config: HousekeepingConfig,
    permits: Arc<Semaphore>,
}

impl Housekeeping {
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn EvaluationBroker>,
        nodes: Arc<dyn NodeDirectory>,
        config: HousekeepingConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            store,
            broker,
            nodes,
            registry: None,
            config,
            permits,
        }
    }

    /// Expires stale nodes of `registry` on every pass.
    pub fn with_registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &HousekeepingConfig {
        &self.config
    }

    /// Run housekeeping until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "Starting housekeeping"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(report) if !report.is_quiet() => info!(
                            nodes_expired = report.nodes_expired.len(),
                            dead_failed = report.dead_failed,
                            requeued = report.requeued,
                            corrective = report.corrective.len(),
                            "Housekeeping pass complete"
                        ),
                        Ok(_) => debug!("Housekeeping pass found nothing to do"),
                        Err(e) => error!(error = %e, "Housekeeping pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Housekeeping shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Runs a single pass as of `now`.
    #[instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> HousekeepingResult<HousekeepingReport> {
        let mut report = HousekeepingReport::default();

        if let Some(registry) = &self.registry {
            let cutoff = now - chrono_duration(self.config.node_heartbeat_timeout);
            report.nodes_expired = registry.expire_stale(cutoff).await;
            for node_id in &report.nodes_expired {
                warn!(node_id = %node_id, "Node missed its heartbeats, marked disconnected");
            }
        }

        report.dead_failed = self.fail_dead_evaluations().await;

        let window = chrono_duration(self.config.timeout);
        let pending = self
            .store
            .list_evaluations(EvaluationQuery::with_status(EvaluationStatus::Pending))
            .await?;
        let mut jobs_with_pending = BTreeSet::new();
        for evaluation in pending {
            jobs_with_pending.insert(evaluation.job_id);
            let idle = now - from_nanos(evaluation.modify_time) > window;
            if idle && !self.broker.contains(evaluation.id).await {
                info!(evaluation_id = %evaluation.id, job_id = %evaluation.job_id, "Re-enqueueing lost evaluation");
                self.broker.enqueue(evaluation).await?;
                report.requeued += 1;
            }
        }

        // Without a node listing only timeouts and idleness are checked.
        let nodes = match self.nodes.list_nodes().await {
            Ok(nodes) => Some(Arc::new(
                nodes
                    .into_iter()
                    .map(|n| (n.id.clone(), n))
                    .collect::<HashMap<NodeId, NodeInfo>>(),
            )),
            Err(e) => {
                warn!(error = %e, "Node directory unavailable during housekeeping");
                None
            }
        };

        let mut inspections = JoinSet::new();
        for job in self.store.list_in_progress_jobs().await? {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone();
            let nodes = nodes.clone();
            let has_pending = jobs_with_pending.contains(&job.id);
            inspections.spawn(async move {
                let _permit = permit;
                let job_id = job.id;
                (job_id, this.inspect_job(job, now, nodes, has_pending).await)
            });
        }

        while let Some(joined) = inspections.join_next().await {
            match joined {
                Ok((_, Ok(Some(evaluation)))) => report.corrective.push(evaluation),
                Ok((_, Ok(None))) => {}
                Ok((job_id, Err(e))) => {
                    error!(job_id = %job_id, error = %e, "Failed to inspect job");
                }
                Err(e) => error!(error = %e, "Job inspection task panicked"),
            }
        }
        report.corrective.sort_by_key(|e| e.job_id);

        Ok(report)
    }

    /// Records dead evaluations as failed. Returns how many were written;
    /// any the store could not take go back to the broker's dead set for the
    /// next pass, so they stay out of the lost-evaluation requeue.
    async fn fail_dead_evaluations(&self) -> usize {
        let mut persisted = 0;
        for evaluation in self.broker.drain_dead().await {
            warn!(
                evaluation_id = %evaluation.id,
                job_id = %evaluation.job_id,
                triggered_by = %evaluation.triggered_by,
                "Evaluation exhausted its deliveries"
            );
            let result = self
                .store
                .update_evaluation_status(
                    evaluation.id,
                    EvaluationStatus::Failed,
                    "delivery attempts exhausted".to_string(),
                )
                .await;
            match result {
                Ok(_) => persisted += 1,
                Err(e) if e.is_already_terminal() || e.is_not_found() => {
                    debug!(evaluation_id = %evaluation.id, error = %e, "Dead evaluation already settled");
                }
                Err(e) => {
                    error!(evaluation_id = %evaluation.id, error = %e, "Failed to persist dead evaluation");
                    self.broker.restore_dead(evaluation).await;
                }
            }
        }
        persisted
    }

    /// Decides whether `job` needs a corrective evaluation and creates it.
    async fn inspect_job(
        &self,
        job: Job,
        now: DateTime<Utc>,
        nodes: Option<Arc<HashMap<NodeId, NodeInfo>>>,
        has_pending: bool,
    ) -> HousekeepingResult<Option<Evaluation>> {
        let executions = self.store.get_executions(job.id).await?;
        let live: Vec<_> = executions.iter().filter(|e| !e.is_terminal_state()).collect();
        let buffer = chrono_duration(self.config.execution_timeout_buffer);

        let timed_out = job.task().and_then(|task| {
            live.iter()
                .find(|e| exceeds_execution_timeout(&job, task, e, now, buffer))
        });
        let departed = nodes.as_ref().and_then(|nodes| {
            live.iter().find(|e| {
                nodes
                    .get(&e.node_id)
                    .is_none_or(|node| !node.is_connected())
            })
        });

        let (trigger, comment) = if let Some(execution) = timed_out {
            (
                EvaluationTrigger::ExecTimeout,
                format!("execution {} timed out", execution.id),
            )
        } else if let Some(execution) = departed {
            (
                EvaluationTrigger::NodeLeave,
                format!("node {} left while running execution {}", execution.node_id, execution.id),
            )
        } else {
            if has_pending {
                return Ok(None);
            }
            // Activity is any write to the job, its executions or its
            // evaluations, and heartbeats from nodes running its executions.
            let evaluations = self
                .store
                .list_evaluations(EvaluationQuery::for_job(job.id))
                .await?;
            let heartbeats = nodes.as_ref().map_or_else(Vec::new, |nodes| {
                live.iter()
                    .filter_map(|e| nodes.get(&e.node_id)?.last_heartbeat)
                    .collect()
            });
            let last_activity = executions
                .iter()
                .map(|e| e.modify_time)
                .chain(evaluations.iter().map(|e| e.modify_time))
                .chain(std::iter::once(job.modify_time))
                .map(from_nanos)
                .chain(heartbeats)
                .max()
                .unwrap_or_else(|| from_nanos(job.modify_time));
            if now - last_activity <= chrono_duration(self.config.timeout) {
                return Ok(None);
            }
            (
                EvaluationTrigger::Defer,
                format!("no activity since {}", last_activity.to_rfc3339()),
            )
        };

        let evaluation = Evaluation::for_job(&job, trigger, now).with_comment(comment);
        let evaluation = self.store.create_evaluation(evaluation).await?;
        self.broker.enqueue(evaluation.clone()).await?;
        info!(
            job_id = %job.id,
            evaluation_id = %evaluation.id,
            triggered_by = %trigger,
            comment = %evaluation.comment,
            "Injected corrective evaluation"
        );
        Ok(Some(evaluation))
    }
}
