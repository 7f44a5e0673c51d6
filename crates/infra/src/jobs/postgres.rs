//! Postgres-backed job store.
//!
//! Schema lives in `migrations/0001_job_engine.sql`; [`PostgresJobStore::ensure_schema`]
//! applies it idempotently. Queries are built at runtime, so the crate compiles
//! without a live database.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//! | PoolClosed, Io, other | N/A | `Storage` |
//!
//! An `UPDATE`/`DELETE` that touches no row maps to `NotFound`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use resaleops_core::{ExecutionId, ScheduledJobId};

use super::store::{JobExecutionLog, JobStore, JobStoreError};
use super::types::{BatchExecutionSummary, JobId, JobResult, JobStatus};
use crate::scheduler::types::{ExecutionStatus, JobExecutionHistory, ScheduledJob};

const SCHEMA: &str = include_str!("../../migrations/0001_job_engine.sql");

/// Postgres implementation of [`JobStore`].
///
/// `Send + Sync`; all access goes through the shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a small pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job engine tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, result), fields(job_id = %result.job_id, status = %result.status), err)]
    async fn log_job_execution(&self, result: &JobResult) -> Result<(), JobStoreError> {
        let log = JobExecutionLog::from_result(result);
        sqlx::query(
            r#"
            INSERT INTO job_execution_logs (
                id, job_id, job_name, status, result, error,
                started_at, completed_at, duration_ms, retry_count, metadata, logged_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(*log.id.as_uuid())
        .bind(log.job_id.as_str())
        .bind(&log.job_name)
        .bind(log.status.as_str())
        .bind(log.result.clone())
        .bind(log.error.clone())
        .bind(log.started_at)
        .bind(log.completed_at)
        .bind(to_i64(log.duration_ms))
        .bind(log.retry_count as i32)
        .bind(log.metadata.clone())
        .bind(log.logged_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("log_job_execution", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn list_job_executions(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<JobExecutionLog>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, job_name, status, result, error,
                   started_at, completed_at, duration_ms, retry_count, metadata, logged_at
            FROM job_execution_logs
            WHERE job_id = $1
            ORDER BY logged_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(job_id.as_str())
        .bind(to_i64(limit as u64))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_job_executions", e))?;

        rows.iter().map(execution_log_from_row).collect()
    }

    #[instrument(
        skip(self, entry),
        fields(scheduled_job_id = %entry.scheduled_job_id, status = %entry.status),
        err
    )]
    async fn record_execution_history(
        &self,
        entry: &JobExecutionHistory,
    ) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_execution_history (
                id, scheduled_job_id, started_at, completed_at, duration_ms, status, summary, error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(*entry.id.as_uuid())
        .bind(*entry.scheduled_job_id.as_uuid())
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .bind(to_i64(entry.duration_ms))
        .bind(entry.status.as_str())
        .bind(Json(&entry.summary))
        .bind(entry.error.clone())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_execution_history", e))?;
        Ok(())
    }

    #[instrument(skip(self, last_error), fields(scheduled_job_id = %id, status = %last_status), err)]
    async fn update_last_run(
        &self,
        id: ScheduledJobId,
        last_run_at: DateTime<Utc>,
        last_status: ExecutionStatus,
        last_error: Option<String>,
    ) -> Result<(), JobStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET last_run_at = $2, last_status = $3, last_error = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .bind(last_run_at)
        .bind(last_status.as_str())
        .bind(last_error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_last_run", e))?;

        require_row(done.rows_affected(), id)
    }

    #[instrument(skip(self, job), fields(scheduled_job_id = %job.id, name = %job.name), err)]
    async fn insert_scheduled_job(&self, job: &ScheduledJob) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (
                id, name, description, cron_schedule, is_enabled,
                last_run_at, next_run_at, last_status, last_error,
                created_at, updated_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(*job.id.as_uuid())
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.cron_schedule)
        .bind(job.is_enabled)
        .bind(job.last_run_at)
        .bind(job.next_run_at)
        .bind(job.last_status.map(|s| s.as_str()))
        .bind(job.last_error.clone())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.metadata.clone())
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_scheduled_job", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(scheduled_job_id = %id), err)]
    async fn get_scheduled_job(
        &self,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, cron_schedule, is_enabled,
                   last_run_at, next_run_at, last_status, last_error,
                   created_at, updated_at, metadata
            FROM scheduled_jobs
            WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_scheduled_job", e))?;

        row.as_ref().map(scheduled_job_from_row).transpose()
    }

    #[instrument(skip(self), fields(scheduled_job_id = %id), err)]
    async fn set_enabled(&self, id: ScheduledJobId, enabled: bool) -> Result<(), JobStoreError> {
        let done = sqlx::query(
            "UPDATE scheduled_jobs SET is_enabled = $2, updated_at = now() WHERE id = $1",
        )
        .bind(*id.as_uuid())
        .bind(enabled)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_enabled", e))?;

        require_row(done.rows_affected(), id)
    }

    #[instrument(skip(self), fields(scheduled_job_id = %id), err)]
    async fn delete_scheduled_job(&self, id: ScheduledJobId) -> Result<(), JobStoreError> {
        let done = sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_scheduled_job", e))?;

        require_row(done.rows_affected(), id)
    }

    #[instrument(skip(self), err)]
    async fn list_scheduled_jobs(
        &self,
        only_enabled: bool,
    ) -> Result<Vec<ScheduledJob>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, description, cron_schedule, is_enabled,
                   last_run_at, next_run_at, last_status, last_error,
                   created_at, updated_at, metadata
            FROM scheduled_jobs
            WHERE ($1 = FALSE OR is_enabled)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(only_enabled)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_scheduled_jobs", e))?;

        rows.iter().map(scheduled_job_from_row).collect()
    }

    #[instrument(skip(self), fields(scheduled_job_id = %id), err)]
    async fn list_execution_history(
        &self,
        id: ScheduledJobId,
        limit: usize,
    ) -> Result<Vec<JobExecutionHistory>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, scheduled_job_id, started_at, completed_at, duration_ms, status, summary, error
            FROM job_execution_history
            WHERE scheduled_job_id = $1
            ORDER BY started_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(*id.as_uuid())
        .bind(to_i64(limit as u64))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_execution_history", e))?;

        rows.iter().map(history_from_row).collect()
    }
}

fn execution_log_from_row(row: &PgRow) -> Result<JobExecutionLog, JobStoreError> {
    let status: String = get(row, "status")?;
    Ok(JobExecutionLog {
        id: ExecutionId::from_uuid(get::<Uuid>(row, "id")?),
        job_id: JobId::new(get::<String>(row, "job_id")?),
        job_name: get(row, "job_name")?,
        status: status.parse::<JobStatus>().map_err(JobStoreError::Serialization)?,
        result: get::<Option<JsonValue>>(row, "result")?,
        error: get(row, "error")?,
        started_at: get(row, "started_at")?,
        completed_at: get(row, "completed_at")?,
        duration_ms: get::<i64>(row, "duration_ms")?.max(0) as u64,
        retry_count: get::<i32>(row, "retry_count")?.max(0) as u32,
        metadata: get(row, "metadata")?,
        logged_at: get(row, "logged_at")?,
    })
}

fn scheduled_job_from_row(row: &PgRow) -> Result<ScheduledJob, JobStoreError> {
    let last_status = get::<Option<String>>(row, "last_status")?
        .map(|s| s.parse::<ExecutionStatus>())
        .transpose()
        .map_err(JobStoreError::Serialization)?;

    Ok(ScheduledJob {
        id: ScheduledJobId::from_uuid(get::<Uuid>(row, "id")?),
        name: get(row, "name")?,
        description: get(row, "description")?,
        cron_schedule: get(row, "cron_schedule")?,
        is_enabled: get(row, "is_enabled")?,
        last_run_at: get(row, "last_run_at")?,
        next_run_at: get(row, "next_run_at")?,
        last_status,
        last_error: get(row, "last_error")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        metadata: get(row, "metadata")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<JobExecutionHistory, JobStoreError> {
    let status: String = get(row, "status")?;
    let Json(summary) = get::<Json<BatchExecutionSummary>>(row, "summary")?;

    Ok(JobExecutionHistory {
        id: ExecutionId::from_uuid(get::<Uuid>(row, "id")?),
        scheduled_job_id: ScheduledJobId::from_uuid(get::<Uuid>(row, "scheduled_job_id")?),
        started_at: get(row, "started_at")?,
        completed_at: get(row, "completed_at")?,
        duration_ms: get::<i64>(row, "duration_ms")?.max(0) as u64,
        status: status
            .parse::<ExecutionStatus>()
            .map_err(JobStoreError::Serialization)?,
        summary,
        error: get(row, "error")?,
    })
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, JobStoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| JobStoreError::Serialization(format!("column {column}: {e}")))
}

fn require_row(rows_affected: u64, id: ScheduledJobId) -> Result<(), JobStoreError> {
    if rows_affected == 0 {
        Err(JobStoreError::NotFound(id))
    } else {
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        for table in ["job_execution_logs", "scheduled_jobs", "job_execution_history"] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn schema_status_checks_cover_every_status() {
        for status in ["pending", "running", "completed", "failed", "timeout", "cancelled"] {
            assert!(SCHEMA.contains(&format!("'{status}'")));
        }
    }

    #[test]
    fn untouched_rows_map_to_not_found() {
        let id = ScheduledJobId::new();
        assert!(matches!(require_row(0, id), Err(JobStoreError::NotFound(got)) if got == id));
        assert!(require_row(1, id).is_ok());
    }

    #[test]
    fn pool_closed_maps_to_storage_error() {
        let err = map_sqlx_error("set_enabled", sqlx::Error::PoolClosed);
        assert!(matches!(err, JobStoreError::Storage(msg) if msg.contains("set_enabled")));
    }

    #[test]
    fn oversized_values_saturate() {
        assert_eq!(to_i64(u64::MAX), i64::MAX);
        assert_eq!(to_i64(42), 42);
    }
}
