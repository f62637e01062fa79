//! Transition events: the "why" attached to every persisted change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Topics and Detail Keys
// =============================================================================

/// Event topic names.
pub mod topics {
    pub const JOB: &str = "Job";
    pub const EXECUTION: &str = "Execution";
    pub const SCHEDULING: &str = "Scheduling";
    pub const HOUSEKEEPING: &str = "Housekeeping";
    pub const NODE: &str = "Node";
}

/// Well-known keys in `Event::details`.
pub mod detail_keys {
    pub const HINT: &str = "hint";
    pub const RETRYABLE: &str = "retryable";
    pub const FAILS_EXECUTION: &str = "fails_execution";
    pub const NODE_ID: &str = "node_id";
    pub const EVALUATION_ID: &str = "evaluation_id";
    pub const ERROR_KIND: &str = "error_kind";
}

// =============================================================================
// Event
// =============================================================================

/// A human-readable account of one state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message: String::new(),
            details: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Overrides the timestamp. Scheduling decisions stamp events with the
    /// evaluation clock so that identical inputs give identical plans.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_hint(self, hint: impl Into<String>) -> Self {
        self.with_detail(detail_keys::HINT, hint)
    }

    pub fn with_retryable(self, retryable: bool) -> Self {
        self.with_detail(detail_keys::RETRYABLE, retryable.to_string())
    }

    pub fn with_fails_execution(self, fails: bool) -> Self {
        self.with_detail(detail_keys::FAILS_EXECUTION, fails.to_string())
    }

    pub fn hint(&self) -> Option<&str> {
        self.details.get(detail_keys::HINT).map(String::as_str)
    }

    /// Returns true if the event marks the execution as failed.
    pub fn fails_execution(&self) -> bool {
        self.details
            .get(detail_keys::FAILS_EXECUTION)
            .is_some_and(|v| v == "true")
    }
}
