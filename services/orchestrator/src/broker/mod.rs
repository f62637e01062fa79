//! Evaluation broker: a priority work queue of evaluations with leases.
//!
//! Delivery is at-least-once. A dequeued evaluation stays invisible while its
//! lease is held; the lease ends with an ack, a nack or the visibility
//! timeout. Evaluations that keep failing are moved to a dead set instead of
//! being redelivered forever.

mod memory;

pub use memory::InMemoryBroker;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use convoy_events::EvaluationStatus;
use convoy_id::{EvaluationId, ReceiptHandle};
use serde::Serialize;
use thiserror::Error;

use crate::models::{Evaluation, EvaluationReceipt};

/// Broker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// How long a dequeued evaluation stays leased without an ack.
    pub visibility_timeout: Duration,

    /// Nacks or lease expiries tolerated before an evaluation is dead.
    pub max_retry_count: u32,

    /// Delay before the first redelivery.
    pub initial_retry_delay: Duration,

    /// Per-delivery delay step for later redeliveries.
    pub subsequent_retry_delay: Duration,

    /// Upper bound on the redelivery delay.
    pub max_retry_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            max_retry_count: 10,
            initial_retry_delay: Duration::from_secs(1),
            subsequent_retry_delay: Duration::from_secs(30),
            max_retry_delay: Duration::from_secs(300),
        }
    }
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No lease is held under this handle.
    #[error("receipt {0} is not inflight")]
    NotInflight(ReceiptHandle),

    /// The lease ended before the ack; the evaluation will be redelivered.
    #[error("lease for receipt {0} expired")]
    LeaseExpired(ReceiptHandle),

    #[error("broker is disabled")]
    Disabled,

    #[error("evaluation {evaluation_id} has status {status} and cannot be enqueued")]
    NotEnqueueable {
        evaluation_id: EvaluationId,
        status: EvaluationStatus,
    },
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Counts by evaluation type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub ready: usize,
    pub waiting: usize,
    pub inflight: usize,
}

/// Point-in-time broker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub enabled: bool,
    /// Visible and waiting for a worker.
    pub total_ready: usize,
    /// Hidden until their `wait_until` or redelivery backoff passes.
    pub total_waiting: usize,
    /// Leased to a worker.
    pub total_inflight: usize,
    /// Exhausted their deliveries and not yet drained.
    pub total_dead: usize,
    pub by_type: BTreeMap<String, TypeStats>,
}

/// Work queue contract used by the worker pool and housekeeping.
#[async_trait]
pub trait EvaluationBroker: Send + Sync {
    /// Adds a pending evaluation. Re-enqueueing a tracked ID is a no-op.
    async fn enqueue(&self, evaluation: Evaluation) -> BrokerResult<()>;

    /// Waits up to `timeout` for the highest-priority visible evaluation and
    /// leases it.
    async fn dequeue(&self, timeout: Duration) -> BrokerResult<Option<EvaluationReceipt>>;

    /// Completes a lease and forgets the evaluation.
    async fn ack(&self, handle: &ReceiptHandle) -> BrokerResult<Evaluation>;

    /// Gives a lease back for redelivery after a backoff.
    async fn nack(&self, handle: &ReceiptHandle) -> BrokerResult<()>;

    /// Restarts the visibility timer of a lease.
    async fn extend_lease(&self, handle: &ReceiptHandle) -> BrokerResult<()>;

    async fn stats(&self) -> BrokerStats;

    /// Whether the evaluation is tracked in any state, dead included.
    async fn contains(&self, evaluation_id: EvaluationId) -> bool;

    /// Removes and returns dead evaluations, marked failed.
    async fn drain_dead(&self) -> Vec<Evaluation>;

    /// Puts a drained evaluation back into the dead set, for when its failure
    /// could not be recorded. It is never redelivered from there.
    async fn restore_dead(&self, evaluation: Evaluation);

    /// Disabling drops all tracked evaluations and fails blocked dequeues.
    async fn set_enabled(&self, enabled: bool);
}
