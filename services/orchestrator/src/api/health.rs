//! Health check endpoint.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::context::Orchestrator;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while the broker is disabled.
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    pub broker_enabled: bool,
}

pub fn routes() -> Router<Orchestrator> {
    Router::new().route("/healthz", get(healthz))
}

async fn healthz(State(orchestrator): State<Orchestrator>) -> impl IntoResponse {
    let broker_enabled = orchestrator.broker_stats().await.enabled;
    Json(HealthResponse {
        status: if broker_enabled { "ok" } else { "degraded" }.to_string(),
        service: "orchestrator".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        broker_enabled,
    })
}
