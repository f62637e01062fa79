use std::collections::BTreeMap;

use convoy_events::{Event, ExecutionDesiredStateType, JobStateType, State};
use convoy_id::{EvaluationId, ExecutionId, NodeId};
use convoy_reconcile::Fingerprint;
use serde::Serialize;

use super::{Evaluation, Execution, ExecutionChanges, Job};

/// Orchestrator-side change to an existing execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionUpdate {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<State<ExecutionDesiredStateType>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<ExecutionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followup_eval_id: Option<EvaluationId>,
    /// Revision the decision was computed against.
    pub expected_revision: u64,
    pub event: Event,
}

impl ExecutionUpdate {
    fn for_execution(execution: &Execution, event: Event) -> Self {
        Self {
            execution_id: execution.id,
            node_id: execution.node_id.clone(),
            desired_state: None,
            next_execution: None,
            followup_eval_id: None,
            expected_revision: execution.revision,
            event,
        }
    }

    pub fn changes(&self) -> ExecutionChanges {
        ExecutionChanges {
            desired_state: self.desired_state.clone(),
            compute_state: None,
            next_execution: self.next_execution,
            followup_eval_id: self.followup_eval_id,
        }
    }
}

/// Changes the scheduler wants for one evaluation. Nothing happens until the
/// plan is applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub evaluation: Evaluation,
    /// Snapshot the plan was computed against.
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_job_state: Option<State<JobStateType>>,
    pub job_events: Vec<Event>,
    pub new_executions: Vec<Execution>,
    /// Creation events for `new_executions`.
    pub execution_events: BTreeMap<ExecutionId, Event>,
    pub updated_executions: BTreeMap<ExecutionId, ExecutionUpdate>,
    pub new_evaluations: Vec<Evaluation>,
}

impl Plan {
    pub fn new(evaluation: Evaluation, job: Job) -> Self {
        Self {
            evaluation,
            job,
            desired_job_state: None,
            job_events: Vec::new(),
            new_executions: Vec::new(),
            execution_events: BTreeMap::new(),
            updated_executions: BTreeMap::new(),
            new_evaluations: Vec::new(),
        }
    }

    /// A plan with nothing to write.
    pub fn is_empty(&self) -> bool {
        self.desired_job_state.is_none()
            && self.job_events.is_empty()
            && self.new_executions.is_empty()
            && self.updated_executions.is_empty()
            && self.new_evaluations.is_empty()
    }

    fn set_job_state(&mut self, state: JobStateType, event: Event) {
        self.desired_job_state = Some(State::new(state).with_message(event.message.clone()));
        self.job_events.push(event);
    }

    pub fn mark_job_failed(&mut self, event: Event) {
        self.set_job_state(JobStateType::Failed, event);
    }

    pub fn mark_job_completed(&mut self, event: Event) {
        self.set_job_state(JobStateType::Completed, event);
    }

    pub fn mark_job_running(&mut self, event: Event) {
        self.set_job_state(JobStateType::Running, event);
    }

    /// Keeps the job pending with a message explaining why it waits.
    pub fn mark_job_queued(&mut self, event: Event) {
        self.set_job_state(JobStateType::Pending, event);
    }

    pub fn is_job_failed(&self) -> bool {
        self.desired_job_state
            .as_ref()
            .is_some_and(|s| s.state_type == JobStateType::Failed)
    }

    /// The job state after this plan is applied.
    pub fn target_job_state(&self) -> State<JobStateType> {
        self.desired_job_state
            .clone()
            .unwrap_or_else(|| self.job.state.clone())
    }

    pub fn append_execution(&mut self, execution: Execution, event: Event) {
        self.execution_events.insert(execution.id, event);
        self.new_executions.push(execution);
    }

    /// Asks the node to stop `execution`.
    pub fn stop_execution(&mut self, execution: &Execution, event: Event) {
        let message = event.message.clone();
        let update = self
            .updated_executions
            .entry(execution.id)
            .or_insert_with(|| ExecutionUpdate::for_execution(execution, event));
        update.desired_state =
            Some(State::new(ExecutionDesiredStateType::Stopped).with_message(message));
    }

    /// Records that `replacement` takes over from the failed `execution`.
    pub fn link_replacement(
        &mut self,
        execution: &Execution,
        replacement: ExecutionId,
        followup_eval_id: EvaluationId,
        event: Event,
    ) {
        let update = self
            .updated_executions
            .entry(execution.id)
            .or_insert_with(|| ExecutionUpdate::for_execution(execution, event));
        update.next_execution = Some(replacement);
        update.followup_eval_id = Some(followup_eval_id);
    }

    pub fn append_evaluation(&mut self, evaluation: Evaluation) {
        self.new_evaluations.push(evaluation);
    }

    /// Stable hash of the whole plan.
    pub fn fingerprint(&self) -> Result<Fingerprint, serde_json::Error> {
        Fingerprint::of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobSpec, Task};
    use chrono::Utc;
    use convoy_events::{topics, EvaluationTrigger, JobType};

    fn plan() -> (Plan, Execution) {
        let job = Job::from_spec(JobSpec::new("j", JobType::Batch, 1, Task::new("t", "docker")));
        let eval = Evaluation::for_job(&job, EvaluationTrigger::ExecFailure, Utc::now());
        let exec = Execution::placed(
            ExecutionId::new(),
            &job,
            eval.id,
            NodeId::new("node-1").unwrap(),
        );
        (Plan::new(eval, job), exec)
    }

    #[test]
    fn test_new_plan_is_empty() {
        let (plan, _) = plan();
        assert!(plan.is_empty());
        assert_eq!(plan.target_job_state().state_type, JobStateType::Pending);
    }

    #[test]
    fn test_stop_and_link_merge_into_one_update() {
        let (mut plan, exec) = plan();
        let replacement = ExecutionId::new();
        let eval_id = plan.evaluation.id;

        plan.stop_execution(&exec, Event::new(topics::SCHEDULING).with_message("node lost"));
        plan.link_replacement(
            &exec,
            replacement,
            eval_id,
            Event::new(topics::SCHEDULING).with_message("replaced"),
        );

        assert_eq!(plan.updated_executions.len(), 1);
        let update = &plan.updated_executions[&exec.id];
        assert_eq!(
            update.desired_state.as_ref().map(|s| s.state_type),
            Some(ExecutionDesiredStateType::Stopped)
        );
        assert_eq!(update.next_execution, Some(replacement));
        assert_eq!(update.followup_eval_id, Some(eval_id));
        assert_eq!(update.event.message, "node lost");
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_mark_job_failed() {
        let (mut plan, _) = plan();
        plan.mark_job_failed(Event::new(topics::JOB).with_message("no tasks"));
        assert!(plan.is_job_failed());
        assert_eq!(plan.target_job_state().message, "no tasks");
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let (mut plan, exec) = plan();
        let before = plan.fingerprint().unwrap();
        assert_eq!(before, plan.clone().fingerprint().unwrap());

        plan.append_execution(exec, Event::new(topics::SCHEDULING));
        assert_ne!(before, plan.fingerprint().unwrap());
    }
}
