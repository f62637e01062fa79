use convoy_events::{ExecutionDesiredStateType, ExecutionStateType, State};
use convoy_id::{EvaluationId, ExecutionId, JobId, NodeId};
use serde::{Deserialize, Serialize};

use super::{Job, Resources};

/// Desired-state messages the scheduler uses when it gives up on a live
/// execution. Executions stopped for these reasons count as failed attempts.
pub mod stop_reasons {
    pub const NODE_LOST: &str = "node lost";
    pub const TIMED_OUT: &str = "execution timed out";
}

/// One placement attempt of a job's task on one node.
///
/// `desired_state` is written by the orchestrator, `compute_state` by the
/// node. Neither side may write the other's field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub namespace: String,
    /// Evaluation that created this execution.
    pub eval_id: EvaluationId,
    pub node_id: NodeId,
    pub allocated_resources: Resources,
    pub desired_state: State<ExecutionDesiredStateType>,
    pub compute_state: State<ExecutionStateType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_execution: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followup_eval_id: Option<EvaluationId>,
    pub revision: u64,
    pub create_time: i64,
    pub modify_time: i64,
}

impl Execution {
    /// A fresh execution placed by a plan: desired Running, compute New.
    pub fn placed(id: ExecutionId, job: &Job, eval_id: EvaluationId, node_id: NodeId) -> Self {
        Self {
            id,
            job_id: job.id,
            namespace: job.namespace.clone(),
            eval_id,
            node_id,
            allocated_resources: job.task().map(|t| t.resources).unwrap_or_default(),
            desired_state: State::new(ExecutionDesiredStateType::Running),
            compute_state: State::new(ExecutionStateType::New),
            previous_execution: None,
            next_execution: None,
            followup_eval_id: None,
            revision: 0,
            create_time: 0,
            modify_time: 0,
        }
    }

    pub fn is_terminal_compute_state(&self) -> bool {
        self.compute_state.state_type.is_terminal()
    }

    pub fn is_terminal_desired_state(&self) -> bool {
        self.desired_state.state_type.is_terminal()
    }

    /// Either side reaching a terminal state freezes the execution.
    pub fn is_terminal_state(&self) -> bool {
        self.is_terminal_desired_state() || self.is_terminal_compute_state()
    }

    /// The node may still be working on it. At most one live execution per
    /// (job, node) may exist.
    pub fn is_live(&self) -> bool {
        !self.is_terminal_compute_state()
    }

    pub fn is_discarded(&self) -> bool {
        self.compute_state.state_type.is_discarded()
    }

    pub fn is_running(&self) -> bool {
        self.compute_state.state_type.is_running()
    }

    pub fn is_completed(&self) -> bool {
        self.compute_state.state_type == ExecutionStateType::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.compute_state.state_type == ExecutionStateType::Failed
    }

    /// Failed on the node, or abandoned by the scheduler because its node
    /// was lost or it ran too long.
    pub fn is_failed_attempt(&self) -> bool {
        if self.is_failed() {
            return true;
        }
        let abandoned = [stop_reasons::NODE_LOST, stop_reasons::TIMED_OUT]
            .contains(&self.desired_state.message.as_str());
        self.is_terminal_desired_state() && abandoned && !self.is_completed()
    }
}

/// Field changes for `UpdateExecution`. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<State<ExecutionDesiredStateType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_state: Option<State<ExecutionStateType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followup_eval_id: Option<EvaluationId>,
}

impl ExecutionChanges {
    pub fn desired(state: State<ExecutionDesiredStateType>) -> Self {
        Self {
            desired_state: Some(state),
            ..Default::default()
        }
    }

    pub fn compute(state: State<ExecutionStateType>) -> Self {
        Self {
            compute_state: Some(state),
            ..Default::default()
        }
    }

    /// Bookkeeping fields may still be written on terminal executions.
    pub fn is_bookkeeping_only(&self) -> bool {
        self.desired_state.is_none() && self.compute_state.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.is_bookkeeping_only() && self.next_execution.is_none() && self.followup_eval_id.is_none()
    }

    /// Writes the changes into `execution`.
    pub fn apply_to(&self, execution: &mut Execution) {
        if let Some(state) = &self.desired_state {
            execution.desired_state = state.clone();
        }
        if let Some(state) = &self.compute_state {
            execution.compute_state = state.clone();
        }
        if let Some(next) = self.next_execution {
            execution.next_execution = Some(next);
        }
        if let Some(eval_id) = self.followup_eval_id {
            execution.followup_eval_id = Some(eval_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobSpec, Task};
    use convoy_events::JobType;

    fn execution() -> Execution {
        let job = Job::from_spec(JobSpec::new("j", JobType::Batch, 1, Task::new("t", "docker")));
        Execution::placed(
            ExecutionId::new(),
            &job,
            EvaluationId::new(),
            NodeId::new("node-1").unwrap(),
        )
    }

    #[test]
    fn test_placed_execution_defaults() {
        let exec = execution();
        assert_eq!(exec.desired_state.state_type, ExecutionDesiredStateType::Running);
        assert_eq!(exec.compute_state.state_type, ExecutionStateType::New);
        assert!(exec.is_live());
        assert!(!exec.is_terminal_state());
    }

    #[test]
    fn test_either_side_terminal_freezes() {
        let mut exec = execution();
        exec.desired_state = State::new(ExecutionDesiredStateType::Stopped);
        assert!(exec.is_terminal_state());
        assert!(exec.is_live(), "node has not confirmed the stop yet");

        let mut exec = execution();
        exec.compute_state = State::new(ExecutionStateType::BidRejected);
        assert!(exec.is_terminal_state());
        assert!(exec.is_discarded());
        assert!(!exec.is_live());
    }

    #[test]
    fn test_failed_attempts() {
        let mut exec = execution();
        assert!(!exec.is_failed_attempt());

        exec.desired_state =
            State::new(ExecutionDesiredStateType::Stopped).with_message(stop_reasons::NODE_LOST);
        assert!(exec.is_failed_attempt());

        exec.compute_state = State::new(ExecutionStateType::Completed);
        assert!(!exec.is_failed_attempt());

        let mut exec = execution();
        exec.desired_state = State::new(ExecutionDesiredStateType::Stopped).with_message("surplus");
        assert!(!exec.is_failed_attempt());
        exec.compute_state = State::new(ExecutionStateType::Failed);
        assert!(exec.is_failed_attempt());
    }

    #[test]
    fn test_changes_apply() {
        let mut exec = execution();
        let next = ExecutionId::new();
        let changes = ExecutionChanges {
            next_execution: Some(next),
            ..Default::default()
        };
        assert!(changes.is_bookkeeping_only());
        assert!(!changes.is_empty());
        changes.apply_to(&mut exec);
        assert_eq!(exec.next_execution, Some(next));

        ExecutionChanges::compute(State::new(ExecutionStateType::Completed)).apply_to(&mut exec);
        assert!(exec.is_completed());
    }
}
