//! State vocabularies for jobs, executions, evaluations and nodes.

use serde::{Deserialize, Serialize};

use crate::EventError;

/// Declares a closed state enum with a stable wire name per variant.
///
/// The wire name is used for JSON, for database columns and for `Display`.
macro_rules! state_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $wire)] $variant ),+
        }

        impl $name {
            /// All variants in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Stable wire name.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = EventError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(EventError::UnknownState {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// =============================================================================
// Job
// =============================================================================

state_enum! {
    /// Kind of workload a job describes.
    JobType, "job type" {
        /// Run `count` replicas to completion.
        Batch => "batch",
        /// Run once on every eligible node to completion.
        Ops => "ops",
        /// Keep `count` replicas running.
        Service => "service",
        /// Keep one replica running on every eligible node.
        Daemon => "daemon",
    }
}

impl JobType {
    /// Service and daemon jobs never complete on their own.
    pub fn is_long_running(&self) -> bool {
        matches!(self, JobType::Service | JobType::Daemon)
    }

    /// Ops and daemon jobs place one execution per eligible node.
    pub fn is_per_node(&self) -> bool {
        matches!(self, JobType::Ops | JobType::Daemon)
    }
}

state_enum! {
    /// Lifecycle of a job.
    JobStateType, "job state" {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Stopped => "stopped",
    }
}

impl JobStateType {
    /// Completed, Failed and Stopped freeze the job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStateType::Completed | JobStateType::Failed | JobStateType::Stopped
        )
    }

    /// Returns true if a job in `self` may move to `next`.
    ///
    /// Re-asserting the current non-terminal state is allowed; it is how a
    /// plan commits against a job whose state does not change.
    pub fn can_transition_to(&self, next: JobStateType) -> bool {
        match self {
            JobStateType::Pending => true,
            JobStateType::Running => next != JobStateType::Pending,
            _ => false,
        }
    }
}

// =============================================================================
// Execution
// =============================================================================

state_enum! {
    /// What the orchestrator wants an execution to do.
    ExecutionDesiredStateType, "desired state" {
        Pending => "pending",
        Running => "running",
        Stopped => "stopped",
    }
}

impl ExecutionDesiredStateType {
    /// Stopped is the only terminal intent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionDesiredStateType::Stopped)
    }
}

state_enum! {
    /// What the node reports an execution is doing.
    ExecutionStateType, "compute state" {
        New => "new",
        AskForBid => "ask_for_bid",
        AskForBidAccepted => "ask_for_bid_accepted",
        AskForBidRejected => "ask_for_bid_rejected",
        /// The node accepted the work and is running it.
        BidAccepted => "bid_accepted",
        BidRejected => "bid_rejected",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl ExecutionStateType {
    /// States after which the node will not touch the execution again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStateType::Completed
                | ExecutionStateType::Failed
                | ExecutionStateType::Cancelled
                | ExecutionStateType::AskForBidRejected
                | ExecutionStateType::BidRejected
        )
    }

    /// Terminal states that did not produce a result.
    pub fn is_discarded(&self) -> bool {
        matches!(
            self,
            ExecutionStateType::AskForBidRejected
                | ExecutionStateType::BidRejected
                | ExecutionStateType::Cancelled
                | ExecutionStateType::Failed
        )
    }

    /// The node has not started running the work yet.
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            ExecutionStateType::New
                | ExecutionStateType::AskForBid
                | ExecutionStateType::AskForBidAccepted
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionStateType::BidAccepted)
    }
}

// =============================================================================
// Evaluation
// =============================================================================

state_enum! {
    /// Processing status of an evaluation.
    EvaluationStatus, "evaluation status" {
        Pending => "pending",
        Blocked => "blocked",
        Complete => "complete",
        Failed => "failed",
        Canceled => "canceled",
    }
}

impl EvaluationStatus {
    /// Only pending evaluations may enter the broker.
    pub fn should_enqueue(&self) -> bool {
        matches!(self, EvaluationStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvaluationStatus::Complete | EvaluationStatus::Failed | EvaluationStatus::Canceled
        )
    }
}

state_enum! {
    /// The event that caused an evaluation to be created.
    EvaluationTrigger, "evaluation trigger" {
        JobRegister => "job-register",
        JobCancel => "job-cancel",
        ExecFailure => "exec-failure",
        ExecUpdate => "exec-update",
        /// Deliberate backoff: not enough nodes, or a lost commit race.
        Defer => "defer",
        ExecTimeout => "exec-timeout",
        NodeLeave => "node-leave",
    }
}

// =============================================================================
// Nodes
// =============================================================================

state_enum! {
    /// Liveness of a node as seen by the node directory.
    NodeConnectionState, "node connection state" {
        Connected => "connected",
        Disconnected => "disconnected",
    }
}

// =============================================================================
// State<T>
// =============================================================================

/// A state together with the reason it was entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State<T> {
    pub state_type: T,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl<T> State<T> {
    pub fn new(state_type: T) -> Self {
        Self {
            state_type,
            message: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl<T: Copy> State<T> {
    /// Returns the state type.
    pub fn get(&self) -> T {
        self.state_type
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ExecutionStateType::New, false, false)]
    #[case(ExecutionStateType::AskForBid, false, false)]
    #[case(ExecutionStateType::AskForBidAccepted, false, false)]
    #[case(ExecutionStateType::AskForBidRejected, true, true)]
    #[case(ExecutionStateType::BidAccepted, false, false)]
    #[case(ExecutionStateType::BidRejected, true, true)]
    #[case(ExecutionStateType::Completed, true, false)]
    #[case(ExecutionStateType::Failed, true, true)]
    #[case(ExecutionStateType::Cancelled, true, true)]
    fn test_compute_state_terminal_and_discarded(
        #[case] state: ExecutionStateType,
        #[case] terminal: bool,
        #[case] discarded: bool,
    ) {
        assert_eq!(state.is_terminal(), terminal);
        assert_eq!(state.is_discarded(), discarded);
    }

    #[rstest]
    #[case(JobStateType::Pending, JobStateType::Running, true)]
    #[case(JobStateType::Pending, JobStateType::Pending, true)]
    #[case(JobStateType::Running, JobStateType::Completed, true)]
    #[case(JobStateType::Running, JobStateType::Pending, false)]
    #[case(JobStateType::Completed, JobStateType::Running, false)]
    #[case(JobStateType::Stopped, JobStateType::Stopped, false)]
    fn test_job_transitions(
        #[case] from: JobStateType,
        #[case] to: JobStateType,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_only_pending_evaluations_enqueue() {
        for status in EvaluationStatus::ALL {
            assert_eq!(
                status.should_enqueue(),
                *status == EvaluationStatus::Pending,
                "{status}"
            );
        }
    }

    #[test]
    fn test_trigger_wire_names() {
        assert_eq!(
            serde_json::to_string(&EvaluationTrigger::JobRegister).unwrap(),
            "\"job-register\""
        );
        assert_eq!(
            "exec-failure".parse::<EvaluationTrigger>().unwrap(),
            EvaluationTrigger::ExecFailure
        );
        assert!(matches!(
            "job-rerun".parse::<EvaluationTrigger>(),
            Err(EventError::UnknownState { .. })
        ));
    }

    #[test]
    fn test_every_state_parses_its_own_name() {
        for state in ExecutionStateType::ALL {
            assert_eq!(state.as_str().parse::<ExecutionStateType>().unwrap(), *state);
        }
        for state in JobStateType::ALL {
            assert_eq!(state.as_str().parse::<JobStateType>().unwrap(), *state);
        }
    }

    #[test]
    fn test_state_message_is_omitted_when_empty() {
        let state = State::new(JobStateType::Pending);
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            serde_json::json!({"state_type": "pending"})
        );
        let state = state.with_message("queued");
        assert_eq!(state.message, "queued");
        assert_eq!(state.get(), JobStateType::Pending);
    }

    #[test]
    fn test_long_running_job_types() {
        assert!(JobType::Service.is_long_running());
        assert!(JobType::Daemon.is_long_running());
        assert!(!JobType::Batch.is_long_running());
        assert!(JobType::Ops.is_per_node());
    }
}
