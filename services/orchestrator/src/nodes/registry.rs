use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use convoy_events::NodeConnectionState;
use convoy_id::NodeId;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::models::NodeInfo;

/// Live node table fed by node registration and heartbeats.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<NodeId, NodeInfo>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or refreshes a node. Returns true if the node was not known
    /// before.
    pub async fn upsert(&self, mut node: NodeInfo, now: DateTime<Utc>) -> bool {
        node.last_heartbeat = Some(now);
        let mut nodes = self.nodes.write().await;
        let is_new = nodes.insert(node.id.clone(), node.clone()).is_none();
        if is_new {
            info!(node_id = %node.id, connection = %node.connection, "Node registered");
        } else {
            debug!(node_id = %node.id, "Node heartbeat");
        }
        is_new
    }

    /// Marks nodes without a heartbeat since `cutoff` as disconnected and
    /// returns their IDs.
    pub async fn expire_stale(&self, cutoff: DateTime<Utc>) -> Vec<NodeId> {
        let mut nodes = self.nodes.write().await;
        let mut expired = Vec::new();
        for node in nodes.values_mut() {
            let stale = node.last_heartbeat.is_some_and(|at| at < cutoff);
            if stale && node.is_connected() {
                node.connection = NodeConnectionState::Disconnected;
                expired.push(node.id.clone());
            }
        }
        expired
    }

    pub async fn get(&self, node_id: &NodeId) -> Option<NodeInfo> {
        self.nodes.read().await.get(node_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<NodeInfo> {
        self.nodes.read().await.values().cloned().collect()
    }
}
