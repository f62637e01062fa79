//! In-memory state store.
//!
//! All records live behind one `RwLock`, so every operation observes and
//! mutates a consistent snapshot.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use convoy_events::{
    topics, Event, EvaluationStatus, HistoryQuery, JobHistory, JobStateType, StateChange,
};
use convoy_id::{EvaluationId, ExecutionId, JobId};
use tokio::sync::RwLock;

use super::{
    check_job_transition, EvaluationQuery, StateStore, StoreError, StoreResult,
    UpdateExecutionRequest, UpdateJobStateRequest,
};
use crate::models::{to_nanos, Evaluation, Execution, Job};

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<JobId, Job>,
    executions: BTreeMap<ExecutionId, Execution>,
    executions_by_job: BTreeMap<JobId, Vec<ExecutionId>>,
    evaluations: BTreeMap<EvaluationId, Evaluation>,
    history: BTreeMap<JobId, Vec<JobHistory>>,
}

impl Inner {
    fn job(&self, job_id: JobId) -> StoreResult<&Job> {
        self.jobs.get(&job_id).ok_or(StoreError::JobNotFound(job_id))
    }

    fn append_history(&mut self, record: JobHistory) {
        self.history.entry(record.job_id).or_default().push(record);
    }
}

/// State store kept entirely in process memory.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Next modify time: the wall clock, but never at or before the previous one.
fn next_modify_time(previous: i64, now: i64) -> i64 {
    now.max(previous.saturating_add(1))
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn create_job(&self, mut job: Job) -> StoreResult<Job> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::JobAlreadyExists(job.id));
        }

        let now = Utc::now();
        job.state = convoy_events::State::new(JobStateType::Pending);
        job.revision = 1;
        job.version = 1;
        job.create_time = to_nanos(now);
        job.modify_time = job.create_time;

        inner.append_history(JobHistory::job(
            job.id,
            StateChange::new(None, JobStateType::Pending),
            job.revision,
            Event::new(topics::JOB).with_message("Job submitted").at(now),
            now,
        ));
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Job> {
        self.inner.read().await.job(job_id).cloned()
    }

    async fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.create_time, j.id));
        Ok(jobs)
    }

    async fn list_in_progress_jobs(&self) -> StoreResult<Vec<Job>> {
        let mut jobs = self.list_jobs().await?;
        jobs.retain(|j| !j.is_terminal());
        Ok(jobs)
    }

    async fn update_job_state(&self, request: UpdateJobStateRequest) -> StoreResult<Job> {
        let mut inner = self.inner.write().await;
        let current = inner.job(request.job_id)?;
        check_job_transition(current, request.new_state.state_type)?;
        request.condition.check(current)?;

        let now = Utc::now();
        let mut job = current.clone();
        let previous = job.state.state_type;
        job.state = request.new_state;
        job.revision += 1;
        job.modify_time = next_modify_time(job.modify_time, to_nanos(now));

        let change = StateChange::new(Some(previous), job.state.state_type);
        let mut events = request.events;
        if events.is_empty() && change.is_change() {
            events.push(
                Event::new(topics::JOB)
                    .with_message(format!("Job state changed to {}", job.state.state_type))
                    .at(now),
            );
        }
        for event in events {
            inner.append_history(JobHistory::job(job.id, change.clone(), job.revision, event, now));
        }

        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn create_execution(
        &self,
        mut execution: Execution,
        event: Event,
    ) -> StoreResult<Execution> {
        let mut inner = self.inner.write().await;
        if inner.executions.contains_key(&execution.id) {
            return Err(StoreError::ExecutionAlreadyExists(execution.id));
        }
        inner.job(execution.job_id)?;

        let live_on_node = inner
            .executions_by_job
            .get(&execution.job_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.executions.get(id))
            .find(|e| e.node_id == execution.node_id && e.is_live());
        if let Some(existing) = live_on_node {
            return Err(StoreError::LiveExecutionExists {
                job_id: execution.job_id,
                node_id: execution.node_id.clone(),
                existing: existing.id,
            });
        }

        let now = Utc::now();
        execution.revision = 1;
        execution.create_time = to_nanos(now);
        execution.modify_time = execution.create_time;

        inner.append_history(
            JobHistory::execution(
                execution.job_id,
                execution.id,
                execution.node_id.clone(),
                execution.revision,
                event,
                now,
            )
            .with_desired_state(StateChange::new(None, execution.desired_state.state_type))
            .with_compute_state(StateChange::new(None, execution.compute_state.state_type)),
        );
        inner
            .executions_by_job
            .entry(execution.job_id)
            .or_default()
            .push(execution.id);
        inner.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, execution_id: ExecutionId) -> StoreResult<Execution> {
        self.inner
            .read()
            .await
            .executions
            .get(&execution_id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    async fn get_executions(&self, job_id: JobId) -> StoreResult<Vec<Execution>> {
        let inner = self.inner.read().await;
        let mut executions: Vec<Execution> = inner
            .executions_by_job
            .get(&job_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.executions.get(id).cloned())
            .collect();
        executions.sort_by_key(|e| (e.create_time, e.id));
        Ok(executions)
    }

    async fn update_execution(&self, request: UpdateExecutionRequest) -> StoreResult<Execution> {
        let mut inner = self.inner.write().await;
        let current = inner
            .executions
            .get(&request.execution_id)
            .ok_or(StoreError::ExecutionNotFound(request.execution_id))?;
        request.check(current)?;

        let now = Utc::now();
        let mut execution = current.clone();
        let previous_desired = execution.desired_state.state_type;
        let previous_compute = execution.compute_state.state_type;
        request.changes.apply_to(&mut execution);
        execution.revision += 1;
        execution.modify_time = next_modify_time(execution.modify_time, to_nanos(now));

        let mut record = JobHistory::execution(
            execution.job_id,
            execution.id,
            execution.node_id.clone(),
            execution.revision,
            request.event,
            now,
        );
        if request.changes.desired_state.is_some() {
            record = record.with_desired_state(StateChange::new(
                Some(previous_desired),
                execution.desired_state.state_type,
            ));
        }
        if request.changes.compute_state.is_some() {
            record = record.with_compute_state(StateChange::new(
                Some(previous_compute),
                execution.compute_state.state_type,
            ));
        }
        inner.append_history(record);

        inner.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn create_evaluation(&self, evaluation: Evaluation) -> StoreResult<Evaluation> {
        let mut inner = self.inner.write().await;
        if inner.evaluations.contains_key(&evaluation.id) {
            return Err(StoreError::EvaluationAlreadyExists(evaluation.id));
        }
        inner.evaluations.insert(evaluation.id, evaluation.clone());
        Ok(evaluation)
    }

    async fn get_evaluation(&self, evaluation_id: EvaluationId) -> StoreResult<Evaluation> {
        self.inner
            .read()
            .await
            .evaluations
            .get(&evaluation_id)
            .cloned()
            .ok_or(StoreError::EvaluationNotFound(evaluation_id))
    }

    async fn list_evaluations(&self, query: EvaluationQuery) -> StoreResult<Vec<Evaluation>> {
        let inner = self.inner.read().await;
        let mut evaluations: Vec<Evaluation> = inner
            .evaluations
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        evaluations.sort_by_key(|e| (e.create_time, e.id));
        Ok(evaluations)
    }

    async fn update_evaluation_status(
        &self,
        evaluation_id: EvaluationId,
        status: EvaluationStatus,
        comment: String,
    ) -> StoreResult<Evaluation> {
        let mut inner = self.inner.write().await;
        let evaluation = inner
            .evaluations
            .get_mut(&evaluation_id)
            .ok_or(StoreError::EvaluationNotFound(evaluation_id))?;
        if evaluation.is_terminal() {
            return Err(StoreError::EvaluationAlreadyTerminal {
                evaluation_id,
                status: evaluation.status,
            });
        }

        evaluation.status = status;
        if !comment.is_empty() {
            evaluation.comment = comment;
        }
        evaluation.update_modify_time(to_nanos(Utc::now()));
        Ok(evaluation.clone())
    }

    async fn get_job_history(
        &self,
        job_id: JobId,
        query: &HistoryQuery,
    ) -> StoreResult<Vec<JobHistory>> {
        let inner = self.inner.read().await;
        inner.job(job_id)?;
        Ok(query.apply(inner.history.get(&job_id).into_iter().flatten()))
    }
}
