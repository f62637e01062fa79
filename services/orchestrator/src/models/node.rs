use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use convoy_events::NodeConnectionState;
use convoy_id::NodeId;
use serde::{Deserialize, Serialize};

use super::{Resources, Task};

/// Point-in-time view of a compute node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Execution engines the node can run.
    #[serde(default)]
    pub engines: Vec<String>,
    /// Storage source types the node can read.
    #[serde(default)]
    pub storage_sources: Vec<String>,
    #[serde(default)]
    pub publishers: Vec<String>,
    #[serde(default)]
    pub total_capacity: Resources,
    #[serde(default)]
    pub available_capacity: Resources,
    /// Resources claimed by work queued on the node but not yet running.
    #[serde(default)]
    pub queue_used_capacity: Resources,
    pub connection: NodeConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl NodeInfo {
    /// A connected node with the given engines and capacity, fully available.
    pub fn new(id: NodeId, engines: &[&str], capacity: Resources) -> Self {
        Self {
            id,
            labels: BTreeMap::new(),
            engines: engines.iter().map(|e| e.to_string()).collect(),
            storage_sources: Vec::new(),
            publishers: Vec::new(),
            total_capacity: capacity,
            available_capacity: capacity,
            queue_used_capacity: Resources::default(),
            connection: NodeConnectionState::Connected,
            last_heartbeat: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connection == NodeConnectionState::Connected
    }

    /// Returns the first capability the node lacks for `task`, if any.
    pub fn missing_capability(&self, task: &Task) -> Option<String> {
        if !self.engines.iter().any(|e| e == &task.engine) {
            return Some(format!("engine {}", task.engine));
        }
        if let Some(source) = task
            .input_sources
            .iter()
            .find(|s| !self.storage_sources.contains(s))
        {
            return Some(format!("storage source {source}"));
        }
        if let Some(publisher) = &task.publisher {
            if !self.publishers.contains(publisher) {
                return Some(format!("publisher {publisher}"));
            }
        }
        None
    }
}
