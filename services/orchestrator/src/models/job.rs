use std::collections::BTreeMap;

use convoy_events::{JobStateType, JobType, State};
use convoy_id::JobId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_JOB_PRIORITY: i32 = 50;

// =============================================================================
// Resources
// =============================================================================

/// Compute resources, either required by a task or offered by a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU cores; fractional values are allowed.
    #[serde(default)]
    pub cpu: f64,
    /// Memory in bytes.
    #[serde(default)]
    pub memory: u64,
    /// Disk in bytes.
    #[serde(default)]
    pub disk: u64,
    #[serde(default)]
    pub gpu: u64,
}

impl Resources {
    pub fn is_zero(&self) -> bool {
        self.cpu == 0.0 && self.memory == 0 && self.disk == 0 && self.gpu == 0
    }

    /// Returns true if every dimension of `self` fits into `capacity`.
    pub fn fits_within(&self, capacity: &Resources) -> bool {
        self.cpu <= capacity.cpu
            && self.memory <= capacity.memory
            && self.disk <= capacity.disk
            && self.gpu <= capacity.gpu
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu + other.cpu,
            memory: self.memory.saturating_add(other.memory),
            disk: self.disk.saturating_add(other.disk),
            gpu: self.gpu.saturating_add(other.gpu),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: self.memory.saturating_sub(other.memory),
            disk: self.disk.saturating_sub(other.disk),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }

    /// Multiplies every dimension by `factor` (used for oversubscription).
    pub fn scaled(&self, factor: f64) -> Resources {
        let scale = |v: u64| (v as f64 * factor).floor() as u64;
        Resources {
            cpu: self.cpu * factor,
            memory: scale(self.memory),
            disk: scale(self.disk),
            gpu: scale(self.gpu),
        }
    }

    fn validate(&self) -> Result<(), JobSpecError> {
        if !self.cpu.is_finite() || self.cpu < 0.0 {
            return Err(JobSpecError::InvalidResources(format!(
                "cpu must be a non-negative number, got {}",
                self.cpu
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Constraints
// =============================================================================

/// Label selector operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintOperator {
    #[serde(rename = "=")]
    Equals,
    #[serde(rename = "!=")]
    NotEquals,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "notin")]
    NotIn,
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "!")]
    DoesNotExist,
}

/// One requirement on node labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub key: String,
    pub operator: ConstraintOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Constraint {
    pub fn new(key: impl Into<String>, operator: ConstraintOperator, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Evaluates the requirement against a node's labels.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            ConstraintOperator::Equals => value == self.values.first(),
            ConstraintOperator::NotEquals => value != self.values.first(),
            ConstraintOperator::In => value.is_some_and(|v| self.values.contains(v)),
            ConstraintOperator::NotIn => !value.is_some_and(|v| self.values.contains(v)),
            ConstraintOperator::Exists => value.is_some(),
            ConstraintOperator::DoesNotExist => value.is_none(),
        }
    }

    fn validate(&self) -> Result<(), JobSpecError> {
        let malformed = |reason: &str| {
            Err(JobSpecError::MalformedConstraint {
                key: self.key.clone(),
                reason: reason.to_string(),
            })
        };

        if self.key.is_empty() {
            return malformed("key must not be empty");
        }
        match self.operator {
            ConstraintOperator::Equals | ConstraintOperator::NotEquals if self.values.len() != 1 => {
                malformed("'=' and '!=' take exactly one value")
            }
            ConstraintOperator::In | ConstraintOperator::NotIn if self.values.is_empty() => {
                malformed("'in' and 'notin' need at least one value")
            }
            ConstraintOperator::Exists | ConstraintOperator::DoesNotExist
                if !self.values.is_empty() =>
            {
                malformed("'exists' and '!' take no values")
            }
            _ => Ok(()),
        }
    }
}

/// Checks that a constraint set is well formed and not self-contradictory.
fn validate_constraints(constraints: &[Constraint]) -> Result<(), JobSpecError> {
    for constraint in constraints {
        constraint.validate()?;
    }

    let contradiction = |key: &str, reason: String| {
        Err(JobSpecError::ContradictoryConstraints {
            key: key.to_string(),
            reason,
        })
    };

    for (i, a) in constraints.iter().enumerate() {
        for b in &constraints[i + 1..] {
            if a.key != b.key {
                continue;
            }
            use ConstraintOperator::*;
            match (a.operator, b.operator) {
                (Exists, DoesNotExist) | (DoesNotExist, Exists) => {
                    return contradiction(&a.key, "required to exist and to be absent".into());
                }
                (Equals, Equals) if a.values != b.values => {
                    return contradiction(
                        &a.key,
                        format!("must equal both '{}' and '{}'", a.values[0], b.values[0]),
                    );
                }
                (Equals, NotEquals) | (NotEquals, Equals) if a.values == b.values => {
                    return contradiction(
                        &a.key,
                        format!("must equal and not equal '{}'", a.values[0]),
                    );
                }
                (Equals, DoesNotExist) | (DoesNotExist, Equals) => {
                    return contradiction(&a.key, "must have a value and be absent".into());
                }
                _ => {}
            }
        }
    }
    Ok(())
}

// =============================================================================
// Task
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Seconds an execution may run before it is stopped. Zero disables the
    /// limit. Ignored for long-running jobs.
    #[serde(default)]
    pub execution_timeout: u64,
    /// Seconds a job may wait for enough nodes before it fails. Zero waits
    /// forever.
    #[serde(default)]
    pub queue_timeout: u64,
}

/// The unit of work placed on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    /// Execution engine the node must support, e.g. `docker` or `wasm`.
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Storage source types the node must be able to read from.
    #[serde(default)]
    pub input_sources: Vec<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Failed attempts that may be replaced before the job fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl Task {
    pub fn new(name: impl Into<String>, engine: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine: engine.into(),
            publisher: None,
            input_sources: Vec::new(),
            resources: Resources::default(),
            timeouts: Timeouts::default(),
            max_retries: None,
        }
    }
}

// =============================================================================
// Job
// =============================================================================

/// Why a submitted job cannot be scheduled.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobSpecError {
    #[error("job has no tasks")]
    NoTasks,

    #[error("{job_type} job needs a count of at least 1")]
    InvalidCount { job_type: JobType },

    #[error("task engine must not be empty")]
    MissingEngine,

    #[error("constraint on '{key}' is malformed: {reason}")]
    MalformedConstraint { key: String, reason: String },

    #[error("constraints on '{key}' cannot be satisfied: {reason}")]
    ContradictoryConstraints { key: String, reason: String },

    #[error("invalid resources: {0}")]
    InvalidResources(String),
}

/// What a client submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    pub tasks: Vec<Task>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_count() -> u32 {
    1
}

fn default_priority() -> i32 {
    DEFAULT_JOB_PRIORITY
}

impl JobSpec {
    /// A single-task spec with default priority and no constraints.
    pub fn new(name: impl Into<String>, job_type: JobType, count: u32, task: Task) -> Self {
        Self {
            name: name.into(),
            namespace: default_namespace(),
            job_type,
            count,
            priority: DEFAULT_JOB_PRIORITY,
            constraints: Vec::new(),
            tasks: vec![task],
        }
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A submitted job with its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub namespace: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub count: u32,
    pub priority: i32,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    pub tasks: Vec<Task>,
    pub state: State<JobStateType>,
    /// Bumped when the job definition changes.
    pub version: u64,
    /// Bumped on every persisted mutation.
    pub revision: u64,
    pub create_time: i64,
    pub modify_time: i64,
}

impl Job {
    /// Builds an unsaved job. The store assigns revision, version and times.
    pub fn from_spec(spec: JobSpec) -> Self {
        Self {
            id: JobId::new(),
            name: spec.name,
            namespace: spec.namespace,
            job_type: spec.job_type,
            count: spec.count,
            priority: spec.priority,
            constraints: spec.constraints,
            tasks: spec.tasks,
            state: State::new(JobStateType::Pending),
            version: 0,
            revision: 0,
            create_time: 0,
            modify_time: 0,
        }
    }

    /// The task that gets scheduled. Only the first task is processed.
    pub fn task(&self) -> Option<&Task> {
        self.tasks.first()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.state_type.is_terminal()
    }

    pub fn is_long_running(&self) -> bool {
        self.job_type.is_long_running()
    }

    /// Checks that the job can be scheduled at all.
    pub fn validate(&self) -> Result<(), JobSpecError> {
        let task = self.task().ok_or(JobSpecError::NoTasks)?;
        if task.engine.trim().is_empty() {
            return Err(JobSpecError::MissingEngine);
        }
        if !self.job_type.is_per_node() && self.count == 0 {
            return Err(JobSpecError::InvalidCount {
                job_type: self.job_type,
            });
        }
        task.resources.validate()?;
        validate_constraints(&self.constraints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case(Constraint::new("zone", ConstraintOperator::Equals, &["a"]), true)]
    #[case(Constraint::new("zone", ConstraintOperator::NotEquals, &["a"]), false)]
    #[case(Constraint::new("zone", ConstraintOperator::In, &["b", "a"]), true)]
    #[case(Constraint::new("zone", ConstraintOperator::NotIn, &["b"]), true)]
    #[case(Constraint::new("gpu", ConstraintOperator::Exists, &[]), false)]
    #[case(Constraint::new("gpu", ConstraintOperator::DoesNotExist, &[]), true)]
    #[case(Constraint::new("gpu", ConstraintOperator::NotEquals, &["x"]), true)]
    fn test_constraint_matching(#[case] constraint: Constraint, #[case] expected: bool) {
        assert_eq!(constraint.matches(&labels(&[("zone", "a")])), expected);
    }

    fn job_with(constraints: Vec<Constraint>) -> Job {
        let mut spec = JobSpec::new("j", JobType::Batch, 1, Task::new("main", "docker"));
        spec.constraints = constraints;
        Job::from_spec(spec)
    }

    #[test]
    fn test_valid_job() {
        let job = job_with(vec![
            Constraint::new("zone", ConstraintOperator::Equals, &["a"]),
            Constraint::new("arch", ConstraintOperator::In, &["amd64", "arm64"]),
        ]);
        assert_eq!(job.validate(), Ok(()));
    }

    #[test]
    fn test_malformed_constraints() {
        let job = job_with(vec![Constraint::new("zone", ConstraintOperator::In, &[])]);
        assert!(matches!(
            job.validate(),
            Err(JobSpecError::MalformedConstraint { .. })
        ));

        let job = job_with(vec![Constraint::new("zone", ConstraintOperator::Equals, &["a", "b"])]);
        assert!(matches!(
            job.validate(),
            Err(JobSpecError::MalformedConstraint { .. })
        ));
    }

    #[test]
    fn test_contradictory_constraints() {
        let job = job_with(vec![
            Constraint::new("zone", ConstraintOperator::Equals, &["a"]),
            Constraint::new("zone", ConstraintOperator::Equals, &["b"]),
        ]);
        assert!(matches!(
            job.validate(),
            Err(JobSpecError::ContradictoryConstraints { .. })
        ));

        let job = job_with(vec![
            Constraint::new("gpu", ConstraintOperator::Exists, &[]),
            Constraint::new("gpu", ConstraintOperator::DoesNotExist, &[]),
        ]);
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_invalid_shapes() {
        let mut job = job_with(vec![]);
        job.tasks.clear();
        assert_eq!(job.validate(), Err(JobSpecError::NoTasks));

        let mut job = job_with(vec![]);
        job.count = 0;
        assert!(matches!(job.validate(), Err(JobSpecError::InvalidCount { .. })));

        let mut job = job_with(vec![]);
        job.job_type = JobType::Daemon;
        job.count = 0;
        assert_eq!(job.validate(), Ok(()));

        let mut job = job_with(vec![]);
        job.tasks[0].resources.cpu = -1.0;
        assert!(matches!(job.validate(), Err(JobSpecError::InvalidResources(_))));
    }

    #[test]
    fn test_resources_arithmetic() {
        let total = Resources {
            cpu: 4.0,
            memory: 8,
            disk: 100,
            gpu: 1,
        };
        let used = Resources {
            cpu: 1.5,
            memory: 10,
            disk: 0,
            gpu: 0,
        };
        let left = total.saturating_sub(&used);
        assert_eq!(left.cpu, 2.5);
        assert_eq!(left.memory, 0);
        assert!(used.fits_within(&total.scaled(1.5)));
        assert!(!used.fits_within(&total));
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "name": "hello",
            "type": "batch",
            "tasks": [{"name": "main", "engine": "docker"}]
        }))
        .unwrap();
        assert_eq!(spec.namespace, DEFAULT_NAMESPACE);
        assert_eq!(spec.count, 1);
        assert_eq!(spec.priority, DEFAULT_JOB_PRIORITY);
    }
}
