//! The orchestrator context.
//!
//! One [`Orchestrator`] is built at startup and handed to the API, the
//! worker pool and housekeeping. It owns the store, broker and node directory
//! handles and implements the external triggers that turn client and node
//! activity into evaluations.

use std::sync::Arc;

use chrono::Utc;
use convoy_events::{
    topics, Event, EvaluationTrigger, ExecutionStateType, HistoryQuery, JobHistory, JobStateType,
    State,
};
use convoy_id::{ExecutionId, JobId, NodeId};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::broker::{BrokerStats, EvaluationBroker};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::housekeeping::{Housekeeping, HousekeepingConfig};
use crate::models::{Evaluation, Execution, ExecutionChanges, Job, JobSpec, NodeInfo};
use crate::nodes::{MergedDirectory, NodeDirectory, NodeRegistry, NodeSource};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::{
    Actor, EvaluationQuery, ExecutionCondition, JobCondition, StateStore, UpdateExecutionRequest,
    UpdateJobStateRequest,
};
use crate::worker::{WorkerConfig, WorkerPool};

/// Tunables of the components the context starts.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub workers: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub housekeeping: HousekeepingConfig,
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers.clone(),
            scheduler: config.scheduler.clone(),
            housekeeping: config.housekeeping.clone(),
        }
    }
}

/// Shared orchestrator state. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn EvaluationBroker>,
    registry: Arc<NodeRegistry>,
    nodes: Arc<dyn NodeDirectory>,
    scheduler: Arc<Scheduler>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Builds a context over an explicit node directory. `registry` receives
    /// node updates from the API and should be one of the directory's
    /// sources.
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn EvaluationBroker>,
        registry: Arc<NodeRegistry>,
        nodes: Arc<dyn NodeDirectory>,
        config: OrchestratorConfig,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            nodes.clone(),
            config.scheduler.clone(),
        ));
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                broker,
                registry,
                nodes,
                scheduler,
                config,
            }),
        }
    }

    /// Builds a context whose directory merges the node registry with the
    /// configured nodes file.
    pub fn from_config(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn EvaluationBroker>,
        config: &Config,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new());
        let mut sources = vec![NodeSource::Registry(registry.clone())];
        if let Some(path) = &config.nodes_file {
            sources.push(NodeSource::File(path.clone()));
        }
        let nodes: Arc<dyn NodeDirectory> =
            Arc::new(MergedDirectory::new(sources).ignore_errors(config.ignore_node_source_errors));
        Self::new(store, broker, registry, nodes, OrchestratorConfig::from(config))
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    pub fn broker(&self) -> &Arc<dyn EvaluationBroker> {
        &self.inner.broker
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.inner.store.clone(),
            self.inner.broker.clone(),
            self.inner.scheduler.clone(),
            self.inner.config.workers.clone(),
        )
    }

    pub fn housekeeping(&self) -> Housekeeping {
        Housekeeping::new(
            self.inner.store.clone(),
            self.inner.broker.clone(),
            self.inner.nodes.clone(),
            self.inner.config.housekeeping.clone(),
        )
        .with_registry(self.inner.registry.clone())
    }

    /// Starts the worker pool and housekeeping. Every task exits once
    /// `shutdown` flips to true.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> JoinSet<()> {
        let mut tasks = self.worker_pool().spawn(shutdown.clone());
        let housekeeping = self.housekeeping();
        tasks.spawn(async move { housekeeping.run(shutdown).await });
        tasks
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Persists a new job and its `job-register` evaluation.
    #[instrument(skip(self, spec), fields(job_name = %spec.name))]
    pub async fn submit_job(&self, spec: JobSpec) -> Result<(Job, Evaluation)> {
        if spec.name.trim().is_empty() {
            return Err(Error::invalid("job name must not be empty"));
        }
        let job = self.inner.store.create_job(Job::from_spec(spec)).await?;
        info!(job_id = %job.id, job_type = %job.job_type, count = job.count, "Job submitted");

        let evaluation = self
            .trigger(&job, EvaluationTrigger::JobRegister, "job submitted")
            .await?;
        Ok((job, evaluation))
    }

    /// Moves a job to Stopped and asks the scheduler to stop its executions.
    #[instrument(skip(self))]
    pub async fn stop_job(&self, job_id: JobId, reason: &str) -> Result<(Job, Evaluation)> {
        let message = if reason.is_empty() {
            "job stopped by user".to_string()
        } else {
            format!("job stopped: {reason}")
        };
        let job = self
            .inner
            .store
            .update_job_state(UpdateJobStateRequest {
                job_id,
                new_state: State::new(JobStateType::Stopped).with_message(message.clone()),
                condition: JobCondition::default(),
                events: vec![Event::new(topics::JOB).with_message(message)],
            })
            .await?;
        info!(job_id = %job.id, "Job stopped");

        let evaluation = self
            .trigger(&job, EvaluationTrigger::JobCancel, "job stopped")
            .await?;
        Ok((job, evaluation))
    }

    /// Records a compute state reported by the node running the execution and
    /// triggers an `exec-failure` or `exec-update` evaluation.
    #[instrument(skip(self, state), fields(state = %state.state_type))]
    pub async fn report_execution_state(
        &self,
        execution_id: ExecutionId,
        state: State<ExecutionStateType>,
    ) -> Result<(Execution, Evaluation)> {
        let current = self.inner.store.get_execution(execution_id).await?;
        let failed = state.state_type == ExecutionStateType::Failed;

        let mut event = Event::new(topics::EXECUTION)
            .with_message(if state.message.is_empty() {
                format!("node reported {}", state.state_type)
            } else {
                state.message.clone()
            })
            .with_detail(
                convoy_events::detail_keys::NODE_ID,
                current.node_id.as_str(),
            );
        if failed {
            event = event.with_fails_execution(true);
        }

        let execution = self
            .inner
            .store
            .update_execution(UpdateExecutionRequest {
                execution_id,
                actor: Actor::Node,
                changes: ExecutionChanges::compute(state),
                condition: ExecutionCondition::at_revision(current.revision),
                event,
            })
            .await?;

        let job = self.inner.store.get_job(execution.job_id).await?;
        let trigger = if failed {
            EvaluationTrigger::ExecFailure
        } else {
            EvaluationTrigger::ExecUpdate
        };
        let comment = format!(
            "execution {} reported {}",
            execution.id, execution.compute_state.state_type
        );
        let evaluation = self.trigger(&job, trigger, &comment).await?;
        Ok((execution, evaluation))
    }

    /// Registers or refreshes a node. A node reported as disconnected
    /// triggers `node-leave` evaluations for jobs with live executions on it.
    #[instrument(skip(self, node), fields(node_id = %node.id))]
    pub async fn update_node(&self, node: NodeInfo) -> Result<Vec<Evaluation>> {
        let node_id = node.id.clone();
        let connected = node.is_connected();
        let previous = self.inner.registry.get(&node_id).await;
        self.inner.registry.upsert(node, Utc::now()).await;

        let was_connected = previous.as_ref().is_some_and(NodeInfo::is_connected);
        if connected || !was_connected {
            return Ok(Vec::new());
        }
        self.node_left(&node_id).await
    }

    async fn node_left(&self, node_id: &NodeId) -> Result<Vec<Evaluation>> {
        let mut evaluations = Vec::new();
        for job in self.inner.store.list_in_progress_jobs().await? {
            let executions = self.inner.store.get_executions(job.id).await?;
            let Some(lost) = executions
                .iter()
                .find(|e| &e.node_id == node_id && e.is_live() && !e.is_terminal_desired_state())
            else {
                continue;
            };
            let comment = format!("node {node_id} left while running execution {}", lost.id);
            evaluations.push(
                self.trigger(&job, EvaluationTrigger::NodeLeave, &comment)
                    .await?,
            );
        }
        if !evaluations.is_empty() {
            warn!(node_id = %node_id, jobs = evaluations.len(), "Node left with live executions");
        }
        Ok(evaluations)
    }

    /// Persists an evaluation for `job` and hands it to the broker.
    async fn trigger(
        &self,
        job: &Job,
        trigger: EvaluationTrigger,
        comment: &str,
    ) -> Result<Evaluation> {
        let evaluation = Evaluation::for_job(job, trigger, Utc::now()).with_comment(comment);
        let evaluation = self.inner.store.create_evaluation(evaluation).await?;
        // The evaluation is durable at this point; housekeeping re-enqueues it
        // if the broker refused it.
        if let Err(e) = self.inner.broker.enqueue(evaluation.clone()).await {
            warn!(evaluation_id = %evaluation.id, error = %e, "Failed to enqueue evaluation");
        }
        Ok(evaluation)
    }

    /// Enqueues every pending evaluation the broker does not hold. Called at
    /// startup, since the broker keeps no state across restarts.
    #[instrument(skip(self))]
    pub async fn restore_pending_evaluations(&self) -> Result<usize> {
        let pending = self
            .inner
            .store
            .list_evaluations(EvaluationQuery::with_status(
                convoy_events::EvaluationStatus::Pending,
            ))
            .await?;

        let mut restored = 0;
        for evaluation in pending {
            if self.inner.broker.contains(evaluation.id).await {
                continue;
            }
            self.inner.broker.enqueue(evaluation).await?;
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "Restored pending evaluations");
        }
        Ok(restored)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        Ok(self.inner.store.get_job(job_id).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.inner.store.list_jobs().await?)
    }

    pub async fn job_executions(&self, job_id: JobId) -> Result<Vec<Execution>> {
        self.inner.store.get_job(job_id).await?;
        Ok(self.inner.store.get_executions(job_id).await?)
    }

    pub async fn job_evaluations(&self, job_id: JobId) -> Result<Vec<Evaluation>> {
        self.inner.store.get_job(job_id).await?;
        Ok(self
            .inner
            .store
            .list_evaluations(EvaluationQuery::for_job(job_id))
            .await?)
    }

    pub async fn job_history(&self, job_id: JobId, query: &HistoryQuery) -> Result<Vec<JobHistory>> {
        self.inner.store.get_job(job_id).await?;
        Ok(self.inner.store.get_job_history(job_id, query).await?)
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.inner.nodes.list_nodes().await?)
    }

    pub async fn broker_stats(&self) -> BrokerStats {
        self.inner.broker.stats().await
    }
}
