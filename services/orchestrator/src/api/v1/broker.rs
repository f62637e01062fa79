use axum::{extract::State, routing::get, Json, Router};

use crate::broker::BrokerStats;
use crate::context::Orchestrator;

pub fn routes() -> Router<Orchestrator> {
    Router::new().route("/stats", get(stats))
}

/// GET /v1/broker/stats
async fn stats(State(orchestrator): State<Orchestrator>) -> Json<BrokerStats> {
    Json(orchestrator.broker_stats().await)
}
