//! API v1 routes.

mod broker;
mod executions;
mod jobs;
mod nodes;

use std::str::FromStr;

use axum::Router;
use convoy_id::IdError;

use crate::api::error::ApiError;
use crate::context::Orchestrator;

pub fn routes() -> Router<Orchestrator> {
    Router::new()
        .nest("/jobs", jobs::routes())
        .nest("/executions", executions::routes())
        .nest("/nodes", nodes::routes())
        .nest("/broker", broker::routes())
}

/// Parses a path identifier, answering 400 on malformed input.
fn parse_id<T>(raw: &str, what: &str) -> Result<T, ApiError>
where
    T: FromStr<Err = IdError>,
{
    raw.parse().map_err(|e: IdError| {
        ApiError::bad_request(format!("invalid_{what}_id"), format!("invalid {what} ID: {e}"))
    })
}
