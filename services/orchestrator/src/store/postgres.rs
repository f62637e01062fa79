//! Postgres state store.
//!
//! Records are stored as JSONB next to the columns used for filtering and
//! locking. Conditional writes run in a transaction that locks the target
//! row with `SELECT ... FOR UPDATE` before checking the condition.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use convoy_events::{
    topics, Event, EvaluationStatus, ExecutionStateType, HistoryQuery, JobHistory, JobStateType,
    State, StateChange,
};
use convoy_id::{EvaluationId, ExecutionId, JobId};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use super::{
    check_job_transition, EvaluationQuery, StateStore, StoreError, StoreResult,
    UpdateExecutionRequest, UpdateJobStateRequest,
};
use crate::models::{to_nanos, Evaluation, Execution, Job};

/// Connection pool settings for the Postgres store.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// `postgres://` URL.
    pub database_url: String,

    /// Pool size cap.
    pub max_connections: u32,

    /// Connections kept open while idle.
    pub min_connections: u32,

    /// How long a query waits for a free connection.
    pub acquire_timeout: Duration,

    /// Idle connections are closed after this long.
    pub idle_timeout: Duration,

    /// Connections are recycled after this long.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/convoy".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let database_url = std::env::var("DATABASE_URL").unwrap_or(defaults.database_url);

        let max_connections = std::env::var("CONVOY_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);

        let min_connections = std::env::var("CONVOY_DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.min_connections);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..defaults
        }
    }
}

/// State store backed by a Postgres connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new connection pool.
    pub async fn connect(config: &DbConfig) -> StoreResult<Self> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    /// Run pending migrations from the first migrations directory found.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        info!("Running database migrations");

        let candidates = [
            PathBuf::from("./migrations"),
            PathBuf::from("services/orchestrator/migrations"),
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator
                        .run(&self.pool)
                        .await
                        .map_err(StoreError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(StoreError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(StoreError::Query)
    }
}

// =============================================================================
// Row helpers
// =============================================================================

fn decode<T: DeserializeOwned>(row: &PgRow) -> StoreResult<T> {
    row.try_get::<Json<T>, _>("body")
        .map(|json| json.0)
        .map_err(|e| StoreError::Decode(e.to_string()))
}

fn decode_all<T: DeserializeOwned>(rows: &[PgRow]) -> StoreResult<Vec<T>> {
    rows.iter().map(decode).collect()
}

fn terminal_compute_states() -> Vec<String> {
    ExecutionStateType::ALL
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| s.as_str().to_string())
        .collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

async fn lock_job(tx: &mut Transaction<'_, Postgres>, job_id: JobId) -> StoreResult<Job> {
    let row = sqlx::query("SELECT body FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(job_id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(StoreError::Query)?
        .ok_or(StoreError::JobNotFound(job_id))?;
    decode(&row)
}

async fn lock_execution(
    tx: &mut Transaction<'_, Postgres>,
    execution_id: ExecutionId,
) -> StoreResult<Execution> {
    let row = sqlx::query("SELECT body FROM executions WHERE id = $1 FOR UPDATE")
        .bind(execution_id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(StoreError::Query)?
        .ok_or(StoreError::ExecutionNotFound(execution_id))?;
    decode(&row)
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    record: &JobHistory,
) -> StoreResult<()> {
    sqlx::query("INSERT INTO job_history (job_id, occurred_at, body) VALUES ($1, $2, $3)")
        .bind(record.job_id.to_string())
        .bind(record.time)
        .bind(Json(record))
        .execute(&mut **tx)
        .await
        .map_err(StoreError::Query)?;
    Ok(())
}

async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> StoreResult<()> {
    sqlx::query("UPDATE jobs SET state = $2, revision = $3, body = $4 WHERE id = $1")
        .bind(job.id.to_string())
        .bind(job.state.state_type.as_str())
        .bind(job.revision as i64)
        .bind(Json(job))
        .execute(&mut **tx)
        .await
        .map_err(StoreError::Query)?;
    Ok(())
}

async fn commit(tx: Transaction<'_, Postgres>) -> StoreResult<()> {
    tx.commit().await.map_err(StoreError::Query)
}

// =============================================================================
// StateStore
// =============================================================================

#[async_trait]
impl StateStore for PostgresStore {
    async fn create_job(&self, mut job: Job) -> StoreResult<Job> {
        let now = Utc::now();
        job.state = State::new(JobStateType::Pending);
        job.revision = 1;
        job.version = 1;
        job.create_time = to_nanos(now);
        job.modify_time = job.create_time;

        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "INSERT INTO jobs (id, state, revision, create_time, body) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job.id.to_string())
        .bind(job.state.state_type.as_str())
        .bind(job.revision as i64)
        .bind(job.create_time)
        .bind(Json(&job))
        .execute(&mut *tx)
        .await;
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(StoreError::JobAlreadyExists(job.id)),
            Err(e) => return Err(StoreError::Query(e)),
        }

        insert_history(
            &mut tx,
            &JobHistory::job(
                job.id,
                StateChange::new(None, JobStateType::Pending),
                job.revision,
                Event::new(topics::JOB).with_message("Job submitted").at(now),
                now,
            ),
        )
        .await?;
        commit(tx).await?;

        debug!(job_id = %job.id, "Job created");
        Ok(job)
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Job> {
        let row = sqlx::query("SELECT body FROM jobs WHERE id = $1")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Query)?
            .ok_or(StoreError::JobNotFound(job_id))?;
        decode(&row)
    }

    async fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query("SELECT body FROM jobs ORDER BY create_time, id")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        decode_all(&rows)
    }

    async fn list_in_progress_jobs(&self) -> StoreResult<Vec<Job>> {
        let terminal: Vec<String> = JobStateType::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query(
            "SELECT body FROM jobs WHERE state <> ALL($1) ORDER BY create_time, id",
        )
        .bind(terminal)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        decode_all(&rows)
    }

    async fn update_job_state(&self, request: UpdateJobStateRequest) -> StoreResult<Job> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, request.job_id).await?;
        check_job_transition(&job, request.new_state.state_type)?;
        request.condition.check(&job)?;

        let now = Utc::now();
        let previous = job.state.state_type;
        job.state = request.new_state;
        job.revision += 1;
        job.modify_time = to_nanos(now).max(job.modify_time.saturating_add(1));
        write_job(&mut tx, &job).await?;

        let change = StateChange::new(Some(previous), job.state.state_type);
        let mut events = request.events;
        if events.is_empty() && change.is_change() {
            events.push(
                Event::new(topics::JOB)
                    .with_message(format!("Job state changed to {}", job.state.state_type))
                    .at(now),
            );
        }
        for event in events {
            insert_history(
                &mut tx,
                &JobHistory::job(job.id, change.clone(), job.revision, event, now),
            )
            .await?;
        }
        commit(tx).await?;
        Ok(job)
    }

    async fn create_execution(
        &self,
        mut execution: Execution,
        event: Event,
    ) -> StoreResult<Execution> {
        let mut tx = self.begin().await?;
        // Serializes placements of the same job.
        lock_job(&mut tx, execution.job_id).await?;

        let existing = sqlx::query("SELECT 1 FROM executions WHERE id = $1")
            .bind(execution.id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::Query)?;
        if existing.is_some() {
            return Err(StoreError::ExecutionAlreadyExists(execution.id));
        }

        let live = sqlx::query(
            "SELECT id FROM executions \
             WHERE job_id = $1 AND node_id = $2 AND compute_state <> ALL($3) LIMIT 1",
        )
        .bind(execution.job_id.to_string())
        .bind(execution.node_id.as_str())
        .bind(terminal_compute_states())
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::Query)?;
        if let Some(row) = live {
            let id: String = row.try_get("id").map_err(StoreError::Query)?;
            let existing = id
                .parse::<ExecutionId>()
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            return Err(StoreError::LiveExecutionExists {
                job_id: execution.job_id,
                node_id: execution.node_id.clone(),
                existing,
            });
        }

        let now = Utc::now();
        execution.revision = 1;
        execution.create_time = to_nanos(now);
        execution.modify_time = execution.create_time;

        sqlx::query(
            "INSERT INTO executions (id, job_id, node_id, compute_state, revision, create_time, body) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(execution.id.to_string())
        .bind(execution.job_id.to_string())
        .bind(execution.node_id.as_str())
        .bind(execution.compute_state.state_type.as_str())
        .bind(execution.revision as i64)
        .bind(execution.create_time)
        .bind(Json(&execution))
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Query)?;

        insert_history(
            &mut tx,
            &JobHistory::execution(
                execution.job_id,
                execution.id,
                execution.node_id.clone(),
                execution.revision,
                event,
                now,
            )
            .with_desired_state(StateChange::new(None, execution.desired_state.state_type))
            .with_compute_state(StateChange::new(None, execution.compute_state.state_type)),
        )
        .await?;
        commit(tx).await?;
        Ok(execution)
    }

    async fn get_execution(&self, execution_id: ExecutionId) -> StoreResult<Execution> {
        let row = sqlx::query("SELECT body FROM executions WHERE id = $1")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Query)?
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        decode(&row)
    }

    async fn get_executions(&self, job_id: JobId) -> StoreResult<Vec<Execution>> {
        let rows =
            sqlx::query("SELECT body FROM executions WHERE job_id = $1 ORDER BY create_time, id")
                .bind(job_id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::Query)?;
        decode_all(&rows)
    }

    async fn update_execution(&self, request: UpdateExecutionRequest) -> StoreResult<Execution> {
        let mut tx = self.begin().await?;
        let mut execution = lock_execution(&mut tx, request.execution_id).await?;
        request.check(&execution)?;

        let now = Utc::now();
        let previous_desired = execution.desired_state.state_type;
        let previous_compute = execution.compute_state.state_type;
        request.changes.apply_to(&mut execution);
        execution.revision += 1;
        execution.modify_time = to_nanos(now).max(execution.modify_time.saturating_add(1));

        sqlx::query(
            "UPDATE executions SET compute_state = $2, revision = $3, body = $4 WHERE id = $1",
        )
        .bind(execution.id.to_string())
        .bind(execution.compute_state.state_type.as_str())
        .bind(execution.revision as i64)
        .bind(Json(&execution))
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Query)?;

        let mut record = JobHistory::execution(
            execution.job_id,
            execution.id,
            execution.node_id.clone(),
            execution.revision,
            request.event,
            now,
        );
        if request.changes.desired_state.is_some() {
            record = record.with_desired_state(StateChange::new(
                Some(previous_desired),
                execution.desired_state.state_type,
            ));
        }
        if request.changes.compute_state.is_some() {
            record = record.with_compute_state(StateChange::new(
                Some(previous_compute),
                execution.compute_state.state_type,
            ));
        }
        insert_history(&mut tx, &record).await?;
        commit(tx).await?;
        Ok(execution)
    }

    async fn create_evaluation(&self, evaluation: Evaluation) -> StoreResult<Evaluation> {
        let result = sqlx::query(
            "INSERT INTO evaluations (id, job_id, status, create_time, body) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(evaluation.id.to_string())
        .bind(evaluation.job_id.to_string())
        .bind(evaluation.status.as_str())
        .bind(evaluation.create_time)
        .bind(Json(&evaluation))
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(evaluation),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::EvaluationAlreadyExists(evaluation.id))
            }
            Err(e) => Err(StoreError::Query(e)),
        }
    }

    async fn get_evaluation(&self, evaluation_id: EvaluationId) -> StoreResult<Evaluation> {
        let row = sqlx::query("SELECT body FROM evaluations WHERE id = $1")
            .bind(evaluation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Query)?
            .ok_or(StoreError::EvaluationNotFound(evaluation_id))?;
        decode(&row)
    }

    async fn list_evaluations(&self, query: EvaluationQuery) -> StoreResult<Vec<Evaluation>> {
        let rows = sqlx::query(
            "SELECT body FROM evaluations \
             WHERE ($1::text IS NULL OR status = $1) AND ($2::text IS NULL OR job_id = $2) \
             ORDER BY create_time, id",
        )
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.job_id.map(|j| j.to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        decode_all(&rows)
    }

    async fn update_evaluation_status(
        &self,
        evaluation_id: EvaluationId,
        status: EvaluationStatus,
        comment: String,
    ) -> StoreResult<Evaluation> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT body FROM evaluations WHERE id = $1 FOR UPDATE")
            .bind(evaluation_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::Query)?
            .ok_or(StoreError::EvaluationNotFound(evaluation_id))?;
        let mut evaluation: Evaluation = decode(&row)?;
        if evaluation.is_terminal() {
            return Err(StoreError::EvaluationAlreadyTerminal {
                evaluation_id,
                status: evaluation.status,
            });
        }

        evaluation.status = status;
        if !comment.is_empty() {
            evaluation.comment = comment;
        }
        evaluation.update_modify_time(to_nanos(Utc::now()));

        sqlx::query("UPDATE evaluations SET status = $2, body = $3 WHERE id = $1")
            .bind(evaluation_id.to_string())
            .bind(evaluation.status.as_str())
            .bind(Json(&evaluation))
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Query)?;
        commit(tx).await?;
        Ok(evaluation)
    }

    async fn get_job_history(
        &self,
        job_id: JobId,
        query: &HistoryQuery,
    ) -> StoreResult<Vec<JobHistory>> {
        // Existence check so an unknown job is NotFound rather than empty.
        self.get_job(job_id).await?;

        let rows = sqlx::query(
            "SELECT body FROM job_history \
             WHERE job_id = $1 AND ($2::timestamptz IS NULL OR occurred_at >= $2) \
             ORDER BY occurred_at, seq",
        )
        .bind(job_id.to_string())
        .bind(query.since)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        let records: Vec<JobHistory> = decode_all(&rows)?;
        Ok(query.apply(&records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_terminal_compute_states_match_partial_index() {
        let mut states = terminal_compute_states();
        states.sort();
        assert_eq!(
            states,
            vec![
                "ask_for_bid_rejected",
                "bid_rejected",
                "cancelled",
                "completed",
                "failed"
            ]
        );
    }
}
