//! Pure reconciliation of one job snapshot into a plan.
//!
//! Given the same evaluation, snapshot and clock the reconciler returns the
//! same plan, including the IDs of new executions and evaluations. A worker
//! that re-derives a plan after a crash therefore proposes exactly the
//! records that may already have been written.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use convoy_events::{
    detail_keys, topics, EvaluationTrigger, Event, JobStateType, JobType,
};
use convoy_id::{EvaluationId, ExecutionId, NodeId};
use convoy_reconcile::{select_for_drain, DrainPriority};
use sha2::{Digest, Sha256};

use super::selection::{has_capacity, ineligibility, rank_nodes};
use super::SchedulerConfig;
use crate::models::{
    from_nanos, stop_reasons, Evaluation, Execution, Job, NodeInfo, Plan, Task,
};

/// Decides what should change for a job.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    config: SchedulerConfig,
}

impl Reconciler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Computes the plan for `evaluation` over a snapshot taken at `now`.
    pub fn reconcile(
        &self,
        evaluation: &Evaluation,
        job: &Job,
        executions: &[Execution],
        nodes: &[NodeInfo],
        now: DateTime<Utc>,
    ) -> Plan {
        let mut pass = Pass {
            config: &self.config,
            evaluation,
            job,
            executions,
            nodes,
            now,
            plan: Plan::new(evaluation.clone(), job.clone()),
        };
        pass.run();
        pass.plan
    }
}

/// Whether `execution` has been running longer than its task allows.
pub(crate) fn exceeds_execution_timeout(
    job: &Job,
    task: &Task,
    execution: &Execution,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> bool {
    let limit = task.timeouts.execution_timeout;
    if job.is_long_running() || limit == 0 {
        return false;
    }
    let limit = seconds(limit)
        .checked_add(&grace)
        .unwrap_or(chrono::Duration::MAX);
    now - from_nanos(execution.create_time) > limit
}

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// 80 bits derived from the evaluation and a discriminator.
fn derived_entropy(evaluation: &Evaluation, parts: &[&str]) -> u128 {
    let mut hasher = Sha256::new();
    hasher.update(evaluation.id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(evaluation.job_id.to_string().as_bytes());
    for part in parts {
        hasher.update(b"|");
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes[6..].copy_from_slice(&digest[..10]);
    u128::from_be_bytes(bytes)
}

fn evaluation_clock_ms(evaluation: &Evaluation) -> u64 {
    u64::try_from(evaluation.create_time / 1_000_000).unwrap_or(0)
}

fn execution_id_for(evaluation: &Evaluation, node_id: &NodeId, slot: usize) -> ExecutionId {
    ExecutionId::from_parts(
        evaluation_clock_ms(evaluation),
        derived_entropy(evaluation, &[node_id.as_str(), &slot.to_string()]),
    )
}

fn defer_id_for(evaluation: &Evaluation) -> EvaluationId {
    EvaluationId::from_parts(
        evaluation_clock_ms(evaluation),
        derived_entropy(evaluation, &["defer"]),
    )
}

/// ID of the evaluation that retries `evaluation` after its plan lost a
/// commit race. Redeliveries of the loser map to the same follow-up.
pub(crate) fn conflict_followup_id(evaluation: &Evaluation) -> EvaluationId {
    EvaluationId::from_parts(
        evaluation_clock_ms(evaluation),
        derived_entropy(evaluation, &["conflict"]),
    )
}

struct Pass<'a> {
    config: &'a SchedulerConfig,
    evaluation: &'a Evaluation,
    job: &'a Job,
    executions: &'a [Execution],
    nodes: &'a [NodeInfo],
    now: DateTime<Utc>,
    plan: Plan,
}

impl<'a> Pass<'a> {
    fn scheduling_event(&self, message: impl Into<String>) -> Event {
        Event::new(topics::SCHEDULING)
            .with_message(message)
            .with_detail(detail_keys::EVALUATION_ID, self.evaluation.id.to_string())
            .at(self.now)
    }

    fn job_event(&self, message: impl Into<String>) -> Event {
        Event::new(topics::JOB)
            .with_message(message)
            .with_detail(detail_keys::EVALUATION_ID, self.evaluation.id.to_string())
            .at(self.now)
    }

    fn stop(&mut self, execution: &Execution, reason: &str) {
        let event = self
            .scheduling_event(reason)
            .with_detail(detail_keys::NODE_ID, execution.node_id.as_str());
        self.plan.stop_execution(execution, event);
    }

    fn fail_job(&mut self, message: String, live: &[&'a Execution]) {
        let event = self.job_event(message);
        self.plan.mark_job_failed(event);
        for execution in live {
            self.stop(execution, "job failed");
        }
    }

    fn run(&mut self) {
        let (job, executions, nodes) = (self.job, self.executions, self.nodes);
        let live: Vec<&Execution> = executions.iter().filter(|e| e.is_live()).collect();
        let active: Vec<&Execution> = live
            .iter()
            .copied()
            .filter(|e| !e.is_terminal_desired_state())
            .collect();

        if job.is_terminal() {
            let reason = format!("job is {}", job.state.state_type);
            for execution in active {
                self.stop(execution, &reason);
            }
            return;
        }

        if let Err(err) = job.validate() {
            self.fail_job(format!("invalid job: {err}"), &active);
            return;
        }
        let Some(task) = job.task() else {
            return;
        };

        let nodes_by_id: HashMap<&NodeId, &NodeInfo> = nodes.iter().map(|n| (&n.id, n)).collect();
        let reachable = |id: &NodeId| nodes_by_id.get(id).is_some_and(|n| n.is_connected());

        // Health: lost and overdue executions are abandoned and replaced.
        let mut failed_attempts: Vec<&Execution> =
            executions.iter().filter(|e| e.is_failed_attempt()).collect();
        let mut healthy = Vec::new();
        for execution in active {
            if !reachable(&execution.node_id) {
                self.stop(execution, stop_reasons::NODE_LOST);
                failed_attempts.push(execution);
            } else if exceeds_execution_timeout(
                job,
                task,
                execution,
                self.now,
                chrono::Duration::zero(),
            ) {
                self.stop(execution, stop_reasons::TIMED_OUT);
                failed_attempts.push(execution);
            } else {
                healthy.push(execution);
            }
        }

        let max_retries = task.max_retries.unwrap_or(self.config.default_max_retries);
        if failed_attempts.len() > max_retries as usize {
            self.fail_job(
                format!(
                    "exceeded max retries: {} failed attempts, {} allowed",
                    failed_attempts.len(),
                    max_retries
                ),
                &healthy,
            );
            return;
        }

        let eligible: Vec<&NodeInfo> = nodes
            .iter()
            .filter(|n| ineligibility(n, job, task).is_none())
            .collect();
        let eligible_ids: BTreeSet<&NodeId> = eligible.iter().map(|n| &n.id).collect();

        let (kept, misplaced): (Vec<&Execution>, Vec<&Execution>) = healthy
            .into_iter()
            .partition(|e| eligible_ids.contains(&e.node_id));
        for execution in misplaced {
            self.stop(execution, "node no longer eligible");
        }

        let completed: Vec<&Execution> = executions.iter().filter(|e| e.is_completed()).collect();
        let completed_nodes: BTreeSet<&NodeId> = completed.iter().map(|e| &e.node_id).collect();
        let occupied: BTreeSet<&NodeId> = live.iter().map(|e| &e.node_id).collect();

        // Work the job still needs, and the nodes allowed to take it.
        let per_node = job.job_type.is_per_node();
        let (kept, deficit, targets): (Vec<&Execution>, usize, Vec<&NodeInfo>) = if per_node {
            let kept_nodes: BTreeSet<&NodeId> = kept.iter().map(|e| &e.node_id).collect();
            let targets: Vec<&NodeInfo> = eligible
                .iter()
                .copied()
                .filter(|n| !kept_nodes.contains(&n.id))
                .filter(|n| job.job_type != JobType::Ops || !completed_nodes.contains(&n.id))
                .collect();
            // Nothing to run on yet still counts as unplaced work.
            let deficit = if eligible.is_empty() { 1 } else { targets.len() };
            (kept, deficit, targets)
        } else {
            let count = job.count as usize;
            let desired = match job.job_type {
                JobType::Batch => count.saturating_sub(completed.len()),
                _ => count,
            };
            let kept = if kept.len() > desired {
                let ordered = select_for_drain(kept, |e| {
                    let class = if e.is_running() {
                        DrainPriority::Running
                    } else {
                        DrainPriority::NotStarted
                    };
                    (class, (e.create_time, e.id))
                });
                let surplus = ordered.len() - desired;
                for execution in &ordered[..surplus] {
                    self.stop(execution, "surplus execution");
                }
                ordered[surplus..].to_vec()
            } else {
                kept
            };
            let deficit = desired - kept.len();
            (kept, deficit, eligible.clone())
        };

        let candidates: Vec<&NodeInfo> = targets
            .into_iter()
            .filter(|n| !occupied.contains(&n.id))
            .filter(|n| has_capacity(n, &task.resources, self.config.oversubscription_factor))
            .collect();
        let mut chosen = rank_nodes(candidates, &task.resources);
        chosen.truncate(deficit);
        let remaining = deficit - chosen.len();

        if remaining > 0 && self.queue_timed_out(task) {
            self.fail_job(
                format!(
                    "not enough nodes to run job: {remaining} of {deficit} executions could not be placed within the queue timeout"
                ),
                &kept,
            );
            return;
        }

        let mut unlinked: Vec<&Execution> = failed_attempts
            .into_iter()
            .filter(|e| e.next_execution.is_none())
            .collect();
        unlinked.sort_by_key(|e| (e.create_time, e.id));
        let mut unlinked = unlinked.into_iter();

        for (slot, node) in chosen.iter().enumerate() {
            let id = execution_id_for(self.evaluation, &node.id, slot);
            let mut execution =
                Execution::placed(id, job, self.evaluation.id, node.id.clone());
            if let Some(previous) = unlinked.next() {
                execution.previous_execution = Some(previous.id);
                let event = self.scheduling_event(format!("replaced by execution {id}"));
                self.plan
                    .link_replacement(previous, id, self.evaluation.id, event);
            }
            let event = self
                .scheduling_event(format!("placed on node {}", node.id))
                .with_detail(detail_keys::NODE_ID, node.id.as_str());
            self.plan.append_execution(execution, event);
        }

        if remaining > 0 {
            self.defer(remaining, chosen.is_empty(), eligible.is_empty());
        }

        self.track_progress(&live, &completed, &eligible, !chosen.is_empty(), &nodes_by_id);
    }

    fn queue_timed_out(&self, task: &Task) -> bool {
        let limit = task.timeouts.queue_timeout;
        if limit == 0 {
            return false;
        }
        self.now - from_nanos(self.job.create_time) >= seconds(limit)
    }

    fn defer(&mut self, remaining: usize, nothing_placed: bool, no_eligible_nodes: bool) {
        let reason = if no_eligible_nodes {
            "no node matches the job"
        } else {
            "not enough capacity on eligible nodes"
        };

        let followup = Evaluation::for_job(self.job, EvaluationTrigger::Defer, self.now)
            .with_id(defer_id_for(self.evaluation))
            .with_comment(format!("{remaining} execution(s) waiting: {reason}"))
            .delayed(self.now, self.config.queue_backoff);
        self.plan.append_evaluation(followup);

        let queued = format!("queued: {reason}");
        if nothing_placed
            && self.job.state.state_type == JobStateType::Pending
            && self.job.state.message != queued
        {
            let event = self.job_event(queued);
            self.plan.mark_job_queued(event);
        }
    }

    fn track_progress(
        &mut self,
        live: &[&Execution],
        completed: &[&Execution],
        eligible: &[&NodeInfo],
        placed: bool,
        nodes_by_id: &HashMap<&NodeId, &NodeInfo>,
    ) {
        if self.plan.is_job_failed() {
            return;
        }

        // Stop requests to vanished nodes will never be confirmed.
        let outstanding = live.iter().any(|e| {
            !e.is_terminal_desired_state()
                || nodes_by_id.get(&e.node_id).is_some_and(|n| n.is_connected())
        });
        let settled = !outstanding && !placed;

        let done = match self.job.job_type {
            JobType::Batch => settled && completed.len() >= self.job.count as usize,
            JobType::Ops => {
                let completed_nodes: BTreeSet<&NodeId> =
                    completed.iter().map(|e| &e.node_id).collect();
                settled
                    && !eligible.is_empty()
                    && eligible.iter().all(|n| completed_nodes.contains(&n.id))
            }
            JobType::Service | JobType::Daemon => false,
        };
        if done {
            let event = self.job_event("all executions completed");
            self.plan.mark_job_completed(event);
            return;
        }

        let pending = self.job.state.state_type == JobStateType::Pending;
        let queued = self
            .plan
            .desired_job_state
            .as_ref()
            .is_some_and(|s| s.state_type == JobStateType::Pending);
        if pending && !queued && self.executions.iter().any(|e| e.is_running()) {
            let event = self.job_event("execution running");
            self.plan.mark_job_running(event);
        }
    }
}
