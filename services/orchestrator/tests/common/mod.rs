//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convoy_events::{Event, EvaluationStatus, HistoryQuery, JobHistory, JobType};
use convoy_id::{EvaluationId, ExecutionId, JobId, NodeId};
use convoy_orchestrator::{
    broker::{BrokerConfig, EvaluationBroker, InMemoryBroker},
    models::{Evaluation, Execution, Job, JobSpec, NodeInfo, Resources, Task},
    nodes::{NodeDirectory, NodeRegistry},
    store::{
        EvaluationQuery, InMemoryStore, StateStore, StoreError, StoreResult,
        UpdateExecutionRequest, UpdateJobStateRequest,
    },
    worker::{Disposition, Worker, WorkerConfig},
    Orchestrator, OrchestratorConfig,
};
use tokio::sync::{watch, Barrier};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,convoy_orchestrator=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn node(name: &str) -> NodeInfo {
    NodeInfo::new(
        NodeId::new(name).unwrap(),
        &["docker"],
        Resources {
            cpu: 8.0,
            memory: 16 << 30,
            disk: 100 << 30,
            gpu: 0,
        },
    )
}

pub fn batch(name: &str, count: u32) -> JobSpec {
    JobSpec::new(name, JobType::Batch, count, Task::new("main", "docker"))
}

/// Broker settings that redeliver immediately, for tests that exercise
/// lease expiry and nacks.
pub fn fast_broker_config() -> BrokerConfig {
    BrokerConfig {
        visibility_timeout: Duration::from_millis(100),
        max_retry_count: 2,
        initial_retry_delay: Duration::ZERO,
        subsequent_retry_delay: Duration::ZERO,
        max_retry_delay: Duration::ZERO,
    }
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        count: 2,
        dequeue_timeout: Duration::from_millis(50),
        conflict_backoff: Duration::from_millis(20),
        ..WorkerConfig::default()
    }
}

// =============================================================================
// TestStore
// =============================================================================

/// In-memory store with hooks for forcing interleavings and outages.
#[derive(Default)]
pub struct TestStore {
    inner: InMemoryStore,
    /// While set, the first two `get_executions` calls wait for each other.
    gate: Option<Barrier>,
    gated_calls: AtomicUsize,
    /// While set, `get_job` fails as if the database were unreachable.
    unavailable: AtomicBool,
    /// While set, `update_evaluation_status` fails the same way.
    status_writes_failing: AtomicBool,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the first two snapshot loads rendezvous, so two schedulers are
    /// guaranteed to see the same revision.
    pub fn gated() -> Self {
        Self {
            gate: Some(Barrier::new(2)),
            ..Self::default()
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_status_writes_failing(&self, failing: bool) {
        self.status_writes_failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for TestStore {
    async fn create_job(&self, job: Job) -> StoreResult<Job> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Job> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Query(sqlx::Error::PoolTimedOut));
        }
        self.inner.get_job(job_id).await
    }

    async fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        self.inner.list_jobs().await
    }

    async fn list_in_progress_jobs(&self) -> StoreResult<Vec<Job>> {
        self.inner.list_in_progress_jobs().await
    }

    async fn update_job_state(&self, request: UpdateJobStateRequest) -> StoreResult<Job> {
        self.inner.update_job_state(request).await
    }

    async fn create_execution(&self, execution: Execution, event: Event) -> StoreResult<Execution> {
        self.inner.create_execution(execution, event).await
    }

    async fn get_execution(&self, execution_id: ExecutionId) -> StoreResult<Execution> {
        self.inner.get_execution(execution_id).await
    }

    async fn get_executions(&self, job_id: JobId) -> StoreResult<Vec<Execution>> {
        let executions = self.inner.get_executions(job_id).await?;
        if let Some(gate) = &self.gate {
            if self.gated_calls.fetch_add(1, Ordering::SeqCst) < 2 {
                gate.wait().await;
            }
        }
        Ok(executions)
    }

    async fn update_execution(&self, request: UpdateExecutionRequest) -> StoreResult<Execution> {
        self.inner.update_execution(request).await
    }

    async fn create_evaluation(&self, evaluation: Evaluation) -> StoreResult<Evaluation> {
        self.inner.create_evaluation(evaluation).await
    }

    async fn get_evaluation(&self, evaluation_id: EvaluationId) -> StoreResult<Evaluation> {
        self.inner.get_evaluation(evaluation_id).await
    }

    async fn list_evaluations(&self, query: EvaluationQuery) -> StoreResult<Vec<Evaluation>> {
        self.inner.list_evaluations(query).await
    }

    async fn update_evaluation_status(
        &self,
        evaluation_id: EvaluationId,
        status: EvaluationStatus,
        comment: String,
    ) -> StoreResult<Evaluation> {
        if self.status_writes_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Query(sqlx::Error::PoolTimedOut));
        }
        self.inner
            .update_evaluation_status(evaluation_id, status, comment)
            .await
    }

    async fn get_job_history(
        &self,
        job_id: JobId,
        query: &HistoryQuery,
    ) -> StoreResult<Vec<JobHistory>> {
        self.inner.get_job_history(job_id, query).await
    }
}

// =============================================================================
// Harness
// =============================================================================

/// An orchestrator over in-memory state plus a worker that tests drive by
/// hand.
pub struct Harness {
    pub store: Arc<TestStore>,
    pub broker: Arc<InMemoryBroker>,
    pub orchestrator: Orchestrator,
    shutdown: watch::Receiver<bool>,
    _shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(TestStore::new(), BrokerConfig::default(), OrchestratorConfig::default())
    }

    pub fn with(store: TestStore, broker: BrokerConfig, config: OrchestratorConfig) -> Self {
        init_tracing();
        let store = Arc::new(store);
        let broker = Arc::new(InMemoryBroker::new(broker));
        let registry = Arc::new(NodeRegistry::new());
        let nodes: Arc<dyn NodeDirectory> = registry.clone();
        let orchestrator = Orchestrator::new(
            store.clone(),
            broker.clone(),
            registry,
            nodes,
            OrchestratorConfig {
                workers: worker_config(),
                ..config
            },
        );
        let (shutdown_tx, shutdown) = watch::channel(false);
        Self {
            store,
            broker,
            orchestrator,
            shutdown,
            _shutdown_tx: shutdown_tx,
        }
    }

    pub fn worker(&self, id: usize) -> Worker {
        Worker::new(
            id,
            self.store.clone(),
            self.broker.clone(),
            self.orchestrator.scheduler().clone(),
            self.orchestrator.config().workers.clone(),
        )
    }

    pub fn shutdown(&self) -> &watch::Receiver<bool> {
        &self.shutdown
    }

    pub async fn add_nodes(&self, names: &[&str]) {
        for name in names {
            self.orchestrator.update_node(node(name)).await.unwrap();
        }
    }

    /// Processes visible evaluations one at a time until the broker has
    /// nothing ready. Returns the dispositions in order.
    pub async fn drain(&self) -> Vec<Disposition> {
        let worker = self.worker(0);
        let mut dispositions = Vec::new();
        while let Some(receipt) = self
            .broker
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
        {
            dispositions.push(worker.process(receipt, &self.shutdown).await.unwrap());
        }
        dispositions
    }

    pub async fn executions(&self, job_id: JobId) -> Vec<Execution> {
        self.store.get_executions(job_id).await.unwrap()
    }

    pub async fn evaluations(&self, job_id: JobId) -> Vec<Evaluation> {
        self.store
            .list_evaluations(EvaluationQuery::for_job(job_id))
            .await
            .unwrap()
    }
}
