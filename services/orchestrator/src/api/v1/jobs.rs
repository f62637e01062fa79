//! Job endpoints: submission, cancellation and read access to executions,
//! evaluations and history.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use convoy_events::{HistoryQuery, JobHistory};
use convoy_id::{EvaluationId, JobId};
use serde::{Deserialize, Serialize};

use super::parse_id;
use crate::api::error::ApiError;
use crate::context::Orchestrator;
use crate::models::{Evaluation, Execution, Job, JobSpec};

pub fn routes() -> Router<Orchestrator> {
    Router::new()
        .route("/", get(list_jobs).post(submit_job))
        .route("/{job_id}", get(get_job).delete(stop_job))
        .route("/{job_id}/executions", get(list_executions))
        .route("/{job_id}/evaluations", get(list_evaluations))
        .route("/{job_id}/history", get(get_history))
}

/// Response to a submission or cancellation.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub job: Job,
    /// The evaluation created for the change.
    pub evaluation_id: EvaluationId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopJobQuery {
    #[serde(default)]
    pub reason: String,
}

/// POST /v1/jobs
async fn submit_job(
    State(orchestrator): State<Orchestrator>,
    Json(spec): Json<JobSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let (job, evaluation) = orchestrator.submit_job(spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(JobResponse {
            job,
            evaluation_id: evaluation.id,
        }),
    ))
}

/// GET /v1/jobs
async fn list_jobs(
    State(orchestrator): State<Orchestrator>,
) -> Result<Json<ListResponse<Job>>, ApiError> {
    let items = orchestrator.list_jobs().await?;
    Ok(Json(ListResponse { items }))
}

/// GET /v1/jobs/{job_id}
async fn get_job(
    State(orchestrator): State<Orchestrator>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job_id: JobId = parse_id(&job_id, "job")?;
    Ok(Json(orchestrator.get_job(job_id).await?))
}

/// DELETE /v1/jobs/{job_id}?reason=...
async fn stop_job(
    State(orchestrator): State<Orchestrator>,
    Path(job_id): Path<String>,
    Query(query): Query<StopJobQuery>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id: JobId = parse_id(&job_id, "job")?;
    let (job, evaluation) = orchestrator.stop_job(job_id, &query.reason).await?;
    Ok(Json(JobResponse {
        job,
        evaluation_id: evaluation.id,
    }))
}

/// GET /v1/jobs/{job_id}/executions
async fn list_executions(
    State(orchestrator): State<Orchestrator>,
    Path(job_id): Path<String>,
) -> Result<Json<ListResponse<Execution>>, ApiError> {
    let job_id: JobId = parse_id(&job_id, "job")?;
    let items = orchestrator.job_executions(job_id).await?;
    Ok(Json(ListResponse { items }))
}

/// GET /v1/jobs/{job_id}/evaluations
async fn list_evaluations(
    State(orchestrator): State<Orchestrator>,
    Path(job_id): Path<String>,
) -> Result<Json<ListResponse<Evaluation>>, ApiError> {
    let job_id: JobId = parse_id(&job_id, "job")?;
    let items = orchestrator.job_evaluations(job_id).await?;
    Ok(Json(ListResponse { items }))
}

/// GET /v1/jobs/{job_id}/history?since=&level=&execution_id=&node_id=
async fn get_history(
    State(orchestrator): State<Orchestrator>,
    Path(job_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ListResponse<JobHistory>>, ApiError> {
    let job_id: JobId = parse_id(&job_id, "job")?;
    let items = orchestrator.job_history(job_id, &query).await?;
    Ok(Json(ListResponse { items }))
}
