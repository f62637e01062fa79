use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_events::EvaluationStatus;
use convoy_id::{EvaluationId, ReceiptHandle};
use convoy_reconcile::redelivery_delay;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{BrokerConfig, BrokerError, BrokerResult, BrokerStats, EvaluationBroker};
use crate::models::{to_nanos, Evaluation, EvaluationReceipt};

/// Expired receipt handles remembered so that a late ack is told its lease
/// expired rather than that the handle is unknown.
const EXPIRED_HANDLE_MEMORY: usize = 1024;

#[derive(Debug, Clone, Copy)]
enum Slot {
    Ready,
    Waiting,
    Inflight {
        handle: ReceiptHandle,
        deadline: Instant,
    },
}

struct Entry {
    evaluation: Evaluation,
    deliveries: u32,
    slot: Slot,
    /// Hold-back deadline while `Waiting`. Redelivery backoff lands here so
    /// the evaluation itself is handed out unchanged.
    not_before: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_visible(&self, now_utc: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|at| at <= now_utc)
    }
}

struct State {
    enabled: bool,
    entries: HashMap<EvaluationId, Entry>,
    leases: HashMap<ReceiptHandle, EvaluationId>,
    expired: VecDeque<ReceiptHandle>,
    dead: Vec<Evaluation>,
}

impl State {
    fn new() -> Self {
        Self {
            enabled: true,
            entries: HashMap::new(),
            leases: HashMap::new(),
            expired: VecDeque::new(),
            dead: Vec::new(),
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.leases.clear();
        self.expired.clear();
        self.dead.clear();
    }

    /// Expires overdue leases, then makes evaluations whose wait is over
    /// visible.
    fn tick(&mut self, now: Instant, now_utc: DateTime<Utc>, config: &BrokerConfig) {
        let overdue: Vec<ReceiptHandle> = self
            .entries
            .values()
            .filter_map(|e| match e.slot {
                Slot::Inflight { handle, deadline } if deadline <= now => Some(handle),
                _ => None,
            })
            .collect();
        for handle in overdue {
            debug!(receipt = %handle, "Lease expired");
            self.release(&handle, now_utc, config);
            if self.expired.len() == EXPIRED_HANDLE_MEMORY {
                self.expired.pop_front();
            }
            self.expired.push_back(handle);
        }

        for entry in self.entries.values_mut() {
            if matches!(entry.slot, Slot::Waiting) && entry.is_visible(now_utc) {
                entry.slot = Slot::Ready;
                entry.not_before = None;
            }
        }
    }

    /// Ends a lease without an ack: redeliver after a backoff, or move to the
    /// dead set once the delivery budget is spent.
    fn release(&mut self, handle: &ReceiptHandle, now_utc: DateTime<Utc>, config: &BrokerConfig) {
        let Some(id) = self.leases.remove(handle) else {
            return;
        };
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };

        if entry.deliveries > config.max_retry_count {
            let Some(entry) = self.entries.remove(&id) else {
                return;
            };
            let mut evaluation = entry.evaluation;
            evaluation.status = EvaluationStatus::Failed;
            evaluation.comment = format!("delivery budget exhausted after {} attempts", entry.deliveries);
            evaluation.update_modify_time(to_nanos(now_utc));
            warn!(
                evaluation_id = %evaluation.id,
                job_id = %evaluation.job_id,
                deliveries = entry.deliveries,
                "Evaluation moved to dead set"
            );
            self.dead.push(evaluation);
            return;
        }

        let delay = redelivery_delay(
            entry.deliveries,
            config.initial_retry_delay,
            config.subsequent_retry_delay,
            config.max_retry_delay,
        );
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        entry.not_before = Some(
            now_utc
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        entry.slot = Slot::Waiting;
    }

    /// Leases the best visible evaluation: highest priority, then oldest,
    /// then lowest ID.
    fn lease_next(&mut self, now: Instant, config: &BrokerConfig) -> Option<EvaluationReceipt> {
        let id = self
            .entries
            .values()
            .filter(|e| matches!(e.slot, Slot::Ready))
            .max_by_key(|e| {
                (
                    e.evaluation.priority,
                    Reverse(e.evaluation.create_time),
                    Reverse(e.evaluation.id),
                )
            })
            .map(|e| e.evaluation.id)?;

        let handle = ReceiptHandle::new();
        let entry = self.entries.get_mut(&id)?;
        entry.deliveries += 1;
        entry.slot = Slot::Inflight {
            handle,
            deadline: now + config.visibility_timeout,
        };
        self.leases.insert(handle, id);

        debug!(
            evaluation_id = %id,
            deliveries = entry.deliveries,
            receipt = %handle,
            "Evaluation leased"
        );
        Some(EvaluationReceipt {
            evaluation: entry.evaluation.clone(),
            receipt_handle: handle,
        })
    }

    /// Earliest instant at which a waiting evaluation becomes visible or a
    /// lease expires.
    fn next_wake(&self, now: Instant, now_utc: DateTime<Utc>) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|e| match e.slot {
                Slot::Ready => None,
                Slot::Inflight { deadline, .. } => Some(deadline),
                Slot::Waiting => {
                    let at = e.not_before?;
                    let wait = (at - now_utc).to_std().unwrap_or(Duration::ZERO);
                    Some(now + wait)
                }
            })
            .min()
    }
}

/// Process-local broker. Durability comes from the store: pending
/// evaluations are re-enqueued at startup and by housekeeping.
pub struct InMemoryBroker {
    config: BrokerConfig,
    state: Mutex<State>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::new()),
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[async_trait]
impl EvaluationBroker for InMemoryBroker {
    async fn enqueue(&self, evaluation: Evaluation) -> BrokerResult<()> {
        if !evaluation.should_enqueue() {
            return Err(BrokerError::NotEnqueueable {
                evaluation_id: evaluation.id,
                status: evaluation.status,
            });
        }

        {
            let mut state = self.state.lock().await;
            if !state.enabled {
                return Err(BrokerError::Disabled);
            }
            let tracked = state.entries.contains_key(&evaluation.id)
                || state.dead.iter().any(|e| e.id == evaluation.id);
            if tracked {
                debug!(evaluation_id = %evaluation.id, "Evaluation already tracked");
                return Ok(());
            }

            let not_before = evaluation.wait_until.filter(|at| *at > Utc::now());
            let slot = if not_before.is_none() {
                Slot::Ready
            } else {
                Slot::Waiting
            };
            debug!(
                evaluation_id = %evaluation.id,
                job_id = %evaluation.job_id,
                triggered_by = %evaluation.triggered_by,
                priority = evaluation.priority,
                "Evaluation enqueued"
            );
            state.entries.insert(
                evaluation.id,
                Entry {
                    evaluation,
                    deliveries: 0,
                    slot,
                    not_before,
                },
            );
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> BrokerResult<Option<EvaluationReceipt>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake = {
                let mut state = self.state.lock().await;
                if !state.enabled {
                    return Err(BrokerError::Disabled);
                }
                let now = Instant::now();
                state.tick(now, Utc::now(), &self.config);
                if let Some(receipt) = state.lease_next(now, &self.config) {
                    return Ok(Some(receipt));
                }
                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_wake(now, Utc::now())
                    .map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, handle: &ReceiptHandle) -> BrokerResult<Evaluation> {
        let mut state = self.state.lock().await;
        state.tick(Instant::now(), Utc::now(), &self.config);

        let Some(id) = state.leases.remove(handle) else {
            if state.expired.contains(handle) {
                return Err(BrokerError::LeaseExpired(*handle));
            }
            return Err(BrokerError::NotInflight(*handle));
        };
        let entry = state
            .entries
            .remove(&id)
            .ok_or(BrokerError::NotInflight(*handle))?;
        debug!(evaluation_id = %id, receipt = %handle, "Evaluation acked");
        Ok(entry.evaluation)
    }

    async fn nack(&self, handle: &ReceiptHandle) -> BrokerResult<()> {
        {
            let mut state = self.state.lock().await;
            let now_utc = Utc::now();
            state.tick(Instant::now(), now_utc, &self.config);

            if !state.leases.contains_key(handle) {
                if state.expired.contains(handle) {
                    return Err(BrokerError::LeaseExpired(*handle));
                }
                return Err(BrokerError::NotInflight(*handle));
            }
            state.release(handle, now_utc, &self.config);
            debug!(receipt = %handle, "Evaluation nacked");
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend_lease(&self, handle: &ReceiptHandle) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.tick(now, Utc::now(), &self.config);

        let Some(id) = state.leases.get(handle).copied() else {
            if state.expired.contains(handle) {
                return Err(BrokerError::LeaseExpired(*handle));
            }
            return Err(BrokerError::NotInflight(*handle));
        };
        let visibility = self.config.visibility_timeout;
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.slot = Slot::Inflight {
                handle: *handle,
                deadline: now + visibility,
            };
        }
        Ok(())
    }

    async fn stats(&self) -> BrokerStats {
        let mut state = self.state.lock().await;
        state.tick(Instant::now(), Utc::now(), &self.config);

        let mut stats = BrokerStats {
            enabled: state.enabled,
            total_dead: state.dead.len(),
            ..Default::default()
        };
        for entry in state.entries.values() {
            let by_type = stats
                .by_type
                .entry(entry.evaluation.job_type.to_string())
                .or_default();
            match entry.slot {
                Slot::Ready => {
                    stats.total_ready += 1;
                    by_type.ready += 1;
                }
                Slot::Waiting => {
                    stats.total_waiting += 1;
                    by_type.waiting += 1;
                }
                Slot::Inflight { .. } => {
                    stats.total_inflight += 1;
                    by_type.inflight += 1;
                }
            }
        }
        stats
    }

    async fn contains(&self, evaluation_id: EvaluationId) -> bool {
        let state = self.state.lock().await;
        state.entries.contains_key(&evaluation_id)
            || state.dead.iter().any(|e| e.id == evaluation_id)
    }

    async fn drain_dead(&self) -> Vec<Evaluation> {
        let mut state = self.state.lock().await;
        state.tick(Instant::now(), Utc::now(), &self.config);
        std::mem::take(&mut state.dead)
    }

    async fn restore_dead(&self, evaluation: Evaluation) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return;
        }
        let tracked = state.entries.contains_key(&evaluation.id)
            || state.dead.iter().any(|e| e.id == evaluation.id);
        if !tracked {
            debug!(evaluation_id = %evaluation.id, "Evaluation returned to dead set");
            state.dead.push(evaluation);
        }
    }

    async fn set_enabled(&self, enabled: bool) {
        {
            let mut state = self.state.lock().await;
            if state.enabled == enabled {
                return;
            }
            state.enabled = enabled;
            if !enabled {
                state.clear();
            }
        }
        info!(enabled, "Evaluation broker state changed");
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, JobSpec, Task};
    use convoy_events::{EvaluationTrigger, JobType};
    use std::sync::Arc;

    fn job(priority: i32) -> Job {
        Job::from_spec(
            JobSpec::new("j", JobType::Batch, 1, Task::new("t", "docker")).with_priority(priority),
        )
    }

    fn eval(priority: i32) -> Evaluation {
        Evaluation::for_job(&job(priority), EvaluationTrigger::JobRegister, Utc::now())
    }

    fn fast_config() -> BrokerConfig {
        BrokerConfig {
            visibility_timeout: Duration::from_secs(60),
            max_retry_count: 2,
            initial_retry_delay: Duration::ZERO,
            subsequent_retry_delay: Duration::ZERO,
            max_retry_delay: Duration::ZERO,
        }
    }

    async fn take(broker: &InMemoryBroker) -> EvaluationReceipt {
        broker
            .dequeue(Duration::from_millis(500))
            .await
            .unwrap()
            .expect("an evaluation should be ready")
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let broker = InMemoryBroker::default();
        let now = Utc::now();
        let low = Evaluation::for_job(&job(10), EvaluationTrigger::JobRegister, now);
        let first = Evaluation::for_job(&job(90), EvaluationTrigger::JobRegister, now);
        let mut second = Evaluation::for_job(&job(90), EvaluationTrigger::JobRegister, now);
        second.create_time += 1;

        for e in [low.clone(), second.clone(), first.clone()] {
            broker.enqueue(e).await.unwrap();
        }

        assert_eq!(take(&broker).await.evaluation.id, first.id);
        assert_eq!(take(&broker).await.evaluation.id, second.id);
        assert_eq!(take(&broker).await.evaluation.id, low.id);
        assert!(broker
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_and_rejects_non_pending() {
        let broker = InMemoryBroker::default();
        let e = eval(50);
        broker.enqueue(e.clone()).await.unwrap();
        broker.enqueue(e.clone()).await.unwrap();
        assert_eq!(broker.stats().await.total_ready, 1);
        assert!(broker.contains(e.id).await);

        let mut done = eval(50);
        done.status = EvaluationStatus::Complete;
        assert!(matches!(
            broker.enqueue(done).await,
            Err(BrokerError::NotEnqueueable { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_until_hides_evaluation() {
        let broker = InMemoryBroker::default();
        let now = Utc::now();
        let delayed = eval(50).delayed(now, Duration::from_millis(300));
        let wait_until = delayed.wait_until.unwrap();
        broker.enqueue(delayed).await.unwrap();

        assert!(broker
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
        assert_eq!(broker.stats().await.total_waiting, 1);

        let receipt = broker.dequeue(Duration::from_secs(2)).await.unwrap().unwrap();
        assert!(Utc::now() >= wait_until);
        broker.ack(&receipt.receipt_handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_blocked_dequeue_wakes_on_enqueue() {
        let broker = Arc::new(InMemoryBroker::default());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let e = eval(50);
        broker.enqueue(e.clone()).await.unwrap();

        let receipt = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(receipt.evaluation.id, e.id);
    }

    #[tokio::test]
    async fn test_redelivery_bound() {
        let config = fast_config();
        let broker = InMemoryBroker::new(config.clone());
        let e = eval(50);
        broker.enqueue(e.clone()).await.unwrap();

        let mut deliveries = 0;
        while let Some(receipt) = broker.dequeue(Duration::from_millis(50)).await.unwrap() {
            deliveries += 1;
            broker.nack(&receipt.receipt_handle).await.unwrap();
        }
        assert_eq!(deliveries, config.max_retry_count + 1);

        assert!(broker.contains(e.id).await);
        let dead = broker.drain_dead().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status, EvaluationStatus::Failed);
        assert!(dead[0].modify_time > e.modify_time);
        assert!(!broker.contains(e.id).await);
    }

    #[tokio::test]
    async fn test_nack_applies_initial_delay() {
        let broker = InMemoryBroker::new(BrokerConfig {
            initial_retry_delay: Duration::from_secs(30),
            ..BrokerConfig::default()
        });
        broker.enqueue(eval(50)).await.unwrap();
        let receipt = take(&broker).await;
        broker.nack(&receipt.receipt_handle).await.unwrap();

        assert!(broker
            .dequeue(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
        assert_eq!(broker.stats().await.total_waiting, 1);
        assert!(matches!(
            broker.nack(&receipt.receipt_handle).await,
            Err(BrokerError::NotInflight(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_expiry_redelivers_and_late_ack_fails() {
        let broker = InMemoryBroker::new(BrokerConfig {
            visibility_timeout: Duration::from_millis(50),
            ..fast_config()
        });
        let e = eval(50);
        broker.enqueue(e.clone()).await.unwrap();
        let first = take(&broker).await;

        let second = take(&broker).await;
        assert_eq!(second.evaluation.id, e.id);
        assert_ne!(second.receipt_handle, first.receipt_handle);

        assert!(matches!(
            broker.ack(&first.receipt_handle).await,
            Err(BrokerError::LeaseExpired(_))
        ));
        let acked = broker.ack(&second.receipt_handle).await.unwrap();
        assert_eq!(acked.id, e.id);
        assert!(!broker.contains(e.id).await);
    }

    #[tokio::test]
    async fn test_extend_lease_keeps_evaluation_hidden() {
        let broker = InMemoryBroker::new(BrokerConfig {
            visibility_timeout: Duration::from_millis(80),
            ..fast_config()
        });
        broker.enqueue(eval(50)).await.unwrap();
        let receipt = take(&broker).await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            broker.extend_lease(&receipt.receipt_handle).await.unwrap();
        }
        assert_eq!(broker.stats().await.total_inflight, 1);
        broker.ack(&receipt.receipt_handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let broker = InMemoryBroker::default();
        let handle = ReceiptHandle::new();
        assert!(matches!(
            broker.ack(&handle).await,
            Err(BrokerError::NotInflight(_))
        ));
        assert!(matches!(
            broker.extend_lease(&handle).await,
            Err(BrokerError::NotInflight(_))
        ));
    }

    #[tokio::test]
    async fn test_disable_flushes_and_fails_waiters() {
        let broker = Arc::new(InMemoryBroker::default());
        broker.enqueue(eval(50)).await.unwrap();
        let receipt = take(&broker).await;

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.set_enabled(false).await;

        assert!(matches!(waiter.await.unwrap(), Err(BrokerError::Disabled)));
        assert!(matches!(
            broker.enqueue(eval(50)).await,
            Err(BrokerError::Disabled)
        ));
        assert!(matches!(
            broker.ack(&receipt.receipt_handle).await,
            Err(BrokerError::NotInflight(_))
        ));

        broker.set_enabled(true).await;
        let stats = broker.stats().await;
        assert!(stats.enabled);
        assert_eq!(stats.total_ready + stats.total_inflight, 0);
    }

    #[tokio::test]
    async fn test_stats_by_type() {
        let broker = InMemoryBroker::default();
        broker.enqueue(eval(50)).await.unwrap();
        broker.enqueue(eval(50)).await.unwrap();
        take(&broker).await;

        let stats = broker.stats().await;
        assert_eq!(stats.total_ready, 1);
        assert_eq!(stats.total_inflight, 1);
        assert_eq!(
            stats.by_type["batch"],
            crate::broker::TypeStats {
                ready: 1,
                waiting: 0,
                inflight: 1
            }
        );
    }

    #[tokio::test]
    async fn test_redelivered_evaluation_is_unchanged() {
        let broker = InMemoryBroker::new(BrokerConfig {
            initial_retry_delay: Duration::from_millis(40),
            ..fast_config()
        });
        let e = eval(50);
        broker.enqueue(e.clone()).await.unwrap();
        let first = take(&broker).await;
        broker.nack(&first.receipt_handle).await.unwrap();

        // Held back by the broker, not by the evaluation.
        assert_eq!(broker.stats().await.total_waiting, 1);
        let second = take(&broker).await;
        assert_eq!(second.evaluation, e);
        assert!(second.evaluation.wait_until.is_none());
    }

    #[tokio::test]
    async fn test_restored_dead_evaluation_is_not_redelivered() {
        let broker = InMemoryBroker::new(BrokerConfig {
            max_retry_count: 0,
            ..fast_config()
        });
        let e = eval(50);
        broker.enqueue(e.clone()).await.unwrap();
        let receipt = take(&broker).await;
        broker.nack(&receipt.receipt_handle).await.unwrap();

        let mut dead = broker.drain_dead().await;
        assert_eq!(dead.len(), 1);
        assert!(!broker.contains(e.id).await);

        let evaluation = dead.remove(0);
        broker.restore_dead(evaluation.clone()).await;
        broker.restore_dead(evaluation).await;
        assert!(broker.contains(e.id).await);
        assert_eq!(broker.stats().await.total_dead, 1);

        // Re-enqueueing a dead evaluation is a no-op.
        broker.enqueue(e.clone()).await.unwrap();
        assert!(broker
            .dequeue(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
        assert_eq!(broker.drain_dead().await.len(), 1);
    }
}
