//! HTTP API handlers and routing.

pub mod error;
mod health;
mod v1;

pub use health::HealthResponse;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::context::Orchestrator;

/// Builds the router with all routes and middleware.
pub fn create_router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(orchestrator)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::broker::{BrokerConfig, EvaluationBroker, InMemoryBroker};
    use crate::context::OrchestratorConfig;
    use crate::nodes::{NodeDirectory, NodeRegistry};
    use crate::store::InMemoryStore;

    fn app() -> (Router, Arc<InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new(BrokerConfig::default()));
        let registry = Arc::new(NodeRegistry::new());
        let nodes: Arc<dyn NodeDirectory> = registry.clone();
        let orchestrator = Orchestrator::new(
            Arc::new(InMemoryStore::new()),
            broker.clone(),
            registry,
            nodes,
            OrchestratorConfig::default(),
        );
        (create_router(orchestrator), broker)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_reports_degraded_broker() {
        let (app, broker) = app();
        let (status, body) = get(app.clone(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        broker.set_enabled(false).await;
        let (status, body) = get(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["broker_enabled"], false);
    }

    #[tokio::test]
    async fn test_empty_listings() {
        let (app, _) = app();
        let (status, body) = get(app.clone(), "/v1/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"], serde_json::json!([]));

        let (status, body) = get(app, "/v1/nodes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"], serde_json::json!([]));
    }
}
