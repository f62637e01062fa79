use std::time::Duration;

use chrono::{DateTime, Utc};
use convoy_events::{EvaluationStatus, EvaluationTrigger, JobType};
use convoy_id::{EvaluationId, JobId, ReceiptHandle};
use serde::{Deserialize, Serialize};

use super::{to_nanos, Job};

/// A request to re-examine one job's scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvaluationId,
    pub namespace: String,
    pub job_id: JobId,
    pub triggered_by: EvaluationTrigger,
    /// Higher values are dequeued first.
    pub priority: i32,
    /// Mirrors the job type.
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: EvaluationStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    /// The broker hides the evaluation until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<DateTime<Utc>>,
    pub create_time: i64,
    pub modify_time: i64,
}

impl Evaluation {
    /// A pending evaluation for `job`, created at `now`.
    pub fn for_job(job: &Job, triggered_by: EvaluationTrigger, now: DateTime<Utc>) -> Self {
        let nanos = to_nanos(now);
        Self {
            id: EvaluationId::new(),
            namespace: job.namespace.clone(),
            job_id: job.id,
            triggered_by,
            priority: job.priority,
            job_type: job.job_type,
            status: EvaluationStatus::Pending,
            comment: String::new(),
            wait_until: None,
            create_time: nanos,
            modify_time: nanos,
        }
    }

    pub fn with_id(mut self, id: EvaluationId) -> Self {
        self.id = id;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_wait_until(mut self, wait_until: DateTime<Utc>) -> Self {
        self.wait_until = Some(wait_until);
        self
    }

    /// Hides the evaluation for `after` from `now`.
    pub fn delayed(self, now: DateTime<Utc>, after: Duration) -> Self {
        let delay = chrono::Duration::from_std(after).unwrap_or(chrono::Duration::MAX);
        let wait_until = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.with_wait_until(wait_until)
    }

    pub fn should_enqueue(&self) -> bool {
        self.status.should_enqueue()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True once `wait_until` (if any) has passed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.wait_until.is_none_or(|at| at <= now)
    }

    /// Advances `modify_time` so it is strictly greater than both the
    /// creation time and its previous value, whatever the wall clock says.
    pub fn update_modify_time(&mut self, now_nanos: i64) {
        self.modify_time = now_nanos
            .max(self.create_time.saturating_add(1))
            .max(self.modify_time.saturating_add(1));
    }
}

/// A dequeued evaluation plus the lease token needed to ack or nack it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationReceipt {
    pub evaluation: Evaluation,
    pub receipt_handle: ReceiptHandle,
}
