//! Execution endpoints. Called by compute nodes to report progress.

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use convoy_events::ExecutionStateType;
use convoy_id::{EvaluationId, ExecutionId};
use serde::{Deserialize, Serialize};

use super::parse_id;
use crate::api::error::ApiError;
use crate::context::Orchestrator;
use crate::models::Execution;

pub fn routes() -> Router<Orchestrator> {
    Router::new().route("/{execution_id}/state", post(report_state))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportStateRequest {
    pub state: ExecutionStateType,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportStateResponse {
    pub execution: Execution,
    pub evaluation_id: EvaluationId,
}

/// POST /v1/executions/{execution_id}/state
async fn report_state(
    State(orchestrator): State<Orchestrator>,
    Path(execution_id): Path<String>,
    Json(req): Json<ReportStateRequest>,
) -> Result<Json<ReportStateResponse>, ApiError> {
    let execution_id: ExecutionId = parse_id(&execution_id, "execution")?;
    let state = convoy_events::State::new(req.state).with_message(req.message);
    let (execution, evaluation) = orchestrator
        .report_execution_state(execution_id, state)
        .await?;
    Ok(Json(ReportStateResponse {
        execution,
        evaluation_id: evaluation.id,
    }))
}
