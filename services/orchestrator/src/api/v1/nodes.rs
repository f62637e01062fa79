//! Node endpoints.
//!
//! Nodes register and heartbeat with `PUT /v1/nodes/{node_id}`; every call
//! replaces the node's advertised capabilities and capacity.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use convoy_events::NodeConnectionState;
use convoy_id::{EvaluationId, NodeId};
use serde::{Deserialize, Serialize};

use super::parse_id;
use crate::api::error::ApiError;
use crate::context::Orchestrator;
use crate::models::{NodeInfo, Resources};

pub fn routes() -> Router<Orchestrator> {
    Router::new()
        .route("/", get(list_nodes))
        .route("/{node_id}", put(update_node))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateNodeRequest {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub engines: Vec<String>,
    #[serde(default)]
    pub storage_sources: Vec<String>,
    #[serde(default)]
    pub publishers: Vec<String>,
    pub total_capacity: Resources,
    /// Defaults to the total capacity.
    #[serde(default)]
    pub available_capacity: Option<Resources>,
    #[serde(default)]
    pub queue_used_capacity: Resources,
    #[serde(default = "connected")]
    pub connection: NodeConnectionState,
}

fn connected() -> NodeConnectionState {
    NodeConnectionState::Connected
}

impl UpdateNodeRequest {
    fn into_node(self, id: NodeId) -> NodeInfo {
        NodeInfo {
            id,
            labels: self.labels,
            engines: self.engines,
            storage_sources: self.storage_sources,
            publishers: self.publishers,
            total_capacity: self.total_capacity,
            available_capacity: self.available_capacity.unwrap_or(self.total_capacity),
            queue_used_capacity: self.queue_used_capacity,
            connection: self.connection,
            last_heartbeat: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateNodeResponse {
    pub node_id: NodeId,
    /// `node-leave` evaluations raised by a disconnect.
    pub evaluations: Vec<EvaluationId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListNodesResponse {
    pub items: Vec<NodeInfo>,
}

/// GET /v1/nodes
async fn list_nodes(
    State(orchestrator): State<Orchestrator>,
) -> Result<Json<ListNodesResponse>, ApiError> {
    let items = orchestrator.list_nodes().await?;
    Ok(Json(ListNodesResponse { items }))
}

/// PUT /v1/nodes/{node_id}
async fn update_node(
    State(orchestrator): State<Orchestrator>,
    Path(node_id): Path<String>,
    Json(req): Json<UpdateNodeRequest>,
) -> Result<Json<UpdateNodeResponse>, ApiError> {
    let node_id: NodeId = parse_id(&node_id, "node")?;
    if req.engines.is_empty() {
        return Err(ApiError::bad_request(
            "invalid_node",
            "a node must advertise at least one engine",
        ));
    }

    let evaluations = orchestrator
        .update_node(req.into_node(node_id.clone()))
        .await?;
    Ok(Json(UpdateNodeResponse {
        node_id,
        evaluations: evaluations.into_iter().map(|e| e.id).collect(),
    }))
}
