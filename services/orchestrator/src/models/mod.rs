//! Domain records shared by the store, the scheduler and the API.
//!
//! Jobs, executions and evaluations are plain serializable data. Links
//! between records (previous/next execution, follow-up evaluation) are IDs
//! into the store, never in-memory references.

mod evaluation;
mod execution;
mod job;
mod node;
mod plan;

pub use evaluation::{Evaluation, EvaluationReceipt};
pub use execution::{stop_reasons, Execution, ExecutionChanges};
pub use job::{
    Constraint, ConstraintOperator, Job, JobSpec, JobSpecError, Resources, Task, Timeouts,
    DEFAULT_JOB_PRIORITY, DEFAULT_NAMESPACE,
};
pub use node::NodeInfo;
pub use plan::{ExecutionUpdate, Plan};

use chrono::{DateTime, Utc};

/// Nanoseconds since the Unix epoch, saturating far in the future.
pub fn to_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Inverse of [`to_nanos`].
pub fn from_nanos(nanos: i64) -> DateTime<Utc> {
    let secs = nanos.div_euclid(1_000_000_000);
    let subsec = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, subsec).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn now_nanos() -> i64 {
    to_nanos(Utc::now())
}
