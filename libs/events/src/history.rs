//! Append-only job history records and the query used to read them.

use chrono::{DateTime, Utc};
use convoy_id::{ExecutionId, JobId, NodeId};
use serde::{Deserialize, Serialize};

use crate::{Event, ExecutionDesiredStateType, ExecutionStateType, JobStateType};

/// Whether a record describes the job itself or one of its executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryLevel {
    Job,
    Execution,
}

impl HistoryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryLevel::Job => "job",
            HistoryLevel::Execution => "execution",
        }
    }
}

/// Before and after of a single state field. `previous` is `None` on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange<T> {
    pub previous: Option<T>,
    pub new: T,
}

impl<T: PartialEq> StateChange<T> {
    pub fn new(previous: Option<T>, new: T) -> Self {
        Self { previous, new }
    }

    pub fn is_change(&self) -> bool {
        self.previous.as_ref() != Some(&self.new)
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistory {
    pub level: HistoryLevel,
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_state: Option<StateChange<JobStateType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<StateChange<ExecutionDesiredStateType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_state: Option<StateChange<ExecutionStateType>>,
    pub new_revision: u64,
    pub event: Event,
    pub time: DateTime<Utc>,
}

impl JobHistory {
    /// Job-level record.
    pub fn job(
        job_id: JobId,
        change: StateChange<JobStateType>,
        new_revision: u64,
        event: Event,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            level: HistoryLevel::Job,
            job_id,
            execution_id: None,
            node_id: None,
            job_state: Some(change),
            desired_state: None,
            compute_state: None,
            new_revision,
            event,
            time,
        }
    }

    /// Execution-level record. State changes are attached with the `with_*`
    /// helpers.
    pub fn execution(
        job_id: JobId,
        execution_id: ExecutionId,
        node_id: NodeId,
        new_revision: u64,
        event: Event,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            level: HistoryLevel::Execution,
            job_id,
            execution_id: Some(execution_id),
            node_id: Some(node_id),
            job_state: None,
            desired_state: None,
            compute_state: None,
            new_revision,
            event,
            time,
        }
    }

    pub fn with_desired_state(mut self, change: StateChange<ExecutionDesiredStateType>) -> Self {
        self.desired_state = Some(change);
        self
    }

    pub fn with_compute_state(mut self, change: StateChange<ExecutionStateType>) -> Self {
        self.compute_state = Some(change);
        self
    }
}

/// Filters for `GetJobHistory`. All set filters must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Only records at or after this instant.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Only records of this level.
    #[serde(default)]
    pub level: Option<HistoryLevel>,
    /// Execution ID prefix, with or without the `exec_` type prefix.
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Node ID prefix.
    #[serde(default)]
    pub node_id: Option<String>,
}

impl HistoryQuery {
    pub fn matches(&self, record: &JobHistory) -> bool {
        if let Some(since) = self.since {
            if record.time < since {
                return false;
            }
        }
        if let Some(level) = self.level {
            if record.level != level {
                return false;
            }
        }
        if let Some(prefix) = self.execution_id.as_deref().filter(|p| !p.is_empty()) {
            match &record.execution_id {
                Some(id) if id.matches_prefix(prefix) => {}
                _ => return false,
            }
        }
        if let Some(prefix) = self.node_id.as_deref().filter(|p| !p.is_empty()) {
            match &record.node_id {
                Some(node) if node.as_str().starts_with(prefix) => {}
                _ => return false,
            }
        }
        true
    }

    /// Applies the query and orders the result by occurrence time. Records
    /// with equal times keep their append order.
    pub fn apply<'a>(&self, records: impl IntoIterator<Item = &'a JobHistory>) -> Vec<JobHistory> {
        let mut matched: Vec<JobHistory> = records
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.time);
        matched
    }
}
