//! Job store boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use resaleops_core::{ExecutionId, ScheduledJobId};

use super::types::{JobId, JobOutput, JobResult, JobStatus};
use crate::scheduler::types::{ExecutionStatus, JobExecutionHistory, ScheduledJob};

/// Persisted record of one terminal [`JobResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub job_name: String,
    pub status: JobStatus,
    pub result: Option<JobOutput>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub retry_count: u32,
    pub metadata: JsonValue,
    pub logged_at: DateTime<Utc>,
}

impl JobExecutionLog {
    pub fn from_result(result: &JobResult) -> Self {
        Self {
            id: ExecutionId::new(),
            job_id: result.job_id.clone(),
            job_name: result.job_name.clone(),
            status: result.status,
            result: result.result.clone(),
            error: result.error.clone(),
            started_at: result.started_at,
            completed_at: result.completed_at,
            duration_ms: result.duration_ms,
            retry_count: result.retry_count,
            metadata: result.metadata.clone(),
            logged_at: Utc::now(),
        }
    }
}

/// Durable storage for execution logs, scheduled jobs and run history.
///
/// Writes from settling jobs arrive concurrently; implementations must accept
/// them without any batch-level transaction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Append the terminal result of one job.
    async fn log_job_execution(&self, result: &JobResult) -> Result<(), JobStoreError>;

    /// Execution logs for a job id, newest first.
    async fn list_job_executions(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<JobExecutionLog>, JobStoreError>;

    /// Append one scheduled-run history row.
    async fn record_execution_history(
        &self,
        entry: &JobExecutionHistory,
    ) -> Result<(), JobStoreError>;

    /// Update last-run metadata of a scheduled job.
    async fn update_last_run(
        &self,
        id: ScheduledJobId,
        last_run_at: DateTime<Utc>,
        last_status: ExecutionStatus,
        last_error: Option<String>,
    ) -> Result<(), JobStoreError>;

    async fn insert_scheduled_job(&self, job: &ScheduledJob) -> Result<(), JobStoreError>;

    async fn get_scheduled_job(
        &self,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>, JobStoreError>;

    async fn set_enabled(&self, id: ScheduledJobId, enabled: bool) -> Result<(), JobStoreError>;

    async fn delete_scheduled_job(&self, id: ScheduledJobId) -> Result<(), JobStoreError>;

    /// Scheduled jobs ordered by creation time; only enabled ones when `only_enabled`.
    async fn list_scheduled_jobs(
        &self,
        only_enabled: bool,
    ) -> Result<Vec<ScheduledJob>, JobStoreError>;

    /// History rows of one scheduled job, newest `started_at` first.
    async fn list_execution_history(
        &self,
        id: ScheduledJobId,
        limit: usize,
    ) -> Result<Vec<JobExecutionHistory>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("scheduled job not found: {0}")]
    NotFound(ScheduledJobId),
    #[error("scheduled job already exists: {0}")]
    AlreadyExists(ScheduledJobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    executions: RwLock<Vec<JobExecutionLog>>,
    scheduled: RwLock<HashMap<ScheduledJobId, ScheduledJob>>,
    history: RwLock<Vec<JobExecutionHistory>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every logged execution, in write order.
    pub fn execution_logs(&self) -> Vec<JobExecutionLog> {
        read(&self.executions).map(|g| g.clone()).unwrap_or_default()
    }

    /// Every history row, in write order.
    pub fn history_entries(&self) -> Vec<JobExecutionHistory> {
        read(&self.history).map(|g| g.clone()).unwrap_or_default()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, JobStoreError> {
    lock.read()
        .map_err(|_| JobStoreError::Storage("in-memory store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, JobStoreError> {
    lock.write()
        .map_err(|_| JobStoreError::Storage("in-memory store lock poisoned".to_string()))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn log_job_execution(&self, result: &JobResult) -> Result<(), JobStoreError> {
        write(&self.executions)?.push(JobExecutionLog::from_result(result));
        Ok(())
    }

    async fn list_job_executions(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<JobExecutionLog>, JobStoreError> {
        let executions = read(&self.executions)?;
        Ok(executions
            .iter()
            .rev()
            .filter(|e| &e.job_id == job_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_execution_history(
        &self,
        entry: &JobExecutionHistory,
    ) -> Result<(), JobStoreError> {
        write(&self.history)?.push(entry.clone());
        Ok(())
    }

    async fn update_last_run(
        &self,
        id: ScheduledJobId,
        last_run_at: DateTime<Utc>,
        last_status: ExecutionStatus,
        last_error: Option<String>,
    ) -> Result<(), JobStoreError> {
        let mut scheduled = write(&self.scheduled)?;
        let job = scheduled.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.last_run_at = Some(last_run_at);
        job.last_status = Some(last_status);
        job.last_error = last_error;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_scheduled_job(&self, job: &ScheduledJob) -> Result<(), JobStoreError> {
        let mut scheduled = write(&self.scheduled)?;
        if scheduled.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        scheduled.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_scheduled_job(
        &self,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>, JobStoreError> {
        Ok(read(&self.scheduled)?.get(&id).cloned())
    }

    async fn set_enabled(&self, id: ScheduledJobId, enabled: bool) -> Result<(), JobStoreError> {
        let mut scheduled = write(&self.scheduled)?;
        let job = scheduled.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.is_enabled = enabled;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_scheduled_job(&self, id: ScheduledJobId) -> Result<(), JobStoreError> {
        write(&self.scheduled)?
            .remove(&id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(id))
    }

    async fn list_scheduled_jobs(
        &self,
        only_enabled: bool,
    ) -> Result<Vec<ScheduledJob>, JobStoreError> {
        let scheduled = read(&self.scheduled)?;
        let mut result: Vec<_> = scheduled
            .values()
            .filter(|j| !only_enabled || j.is_enabled)
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    async fn list_execution_history(
        &self,
        id: ScheduledJobId,
        limit: usize,
    ) -> Result<Vec<JobExecutionHistory>, JobStoreError> {
        let history = read(&self.history)?;
        let mut result: Vec<_> = history
            .iter()
            .filter(|h| h.scheduled_job_id == id)
            .cloned()
            .collect();

        result.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::BatchExecutionSummary;

    fn completed(job_id: &str) -> JobResult {
        let now = Utc::now();
        JobResult {
            job_id: JobId::new(job_id),
            job_name: job_id.to_string(),
            status: JobStatus::Completed,
            result: Some(serde_json::json!({"ok": true})),
            error: None,
            started_at: now,
            completed_at: now,
            duration_ms: 1,
            retry_count: 0,
            metadata: serde_json::json!({"sku": "A-1"}),
        }
    }

    #[tokio::test]
    async fn execution_logs_are_listed_newest_first() {
        let store = InMemoryJobStore::new();
        let mut first = completed("fetch");
        first.retry_count = 1;
        store.log_job_execution(&first).await.unwrap();
        store.log_job_execution(&completed("other")).await.unwrap();
        store.log_job_execution(&completed("fetch")).await.unwrap();

        let logs = store.list_job_executions(&JobId::new("fetch"), 10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].retry_count, 0);
        assert_eq!(logs[1].retry_count, 1);
        assert_eq!(logs[1].metadata["sku"], "A-1");

        let limited = store.list_job_executions(&JobId::new("fetch"), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn enable_filter_and_delete() {
        let store = InMemoryJobStore::new();
        let a = ScheduledJob::new("a", "", "* * * * *", serde_json::json!({}));
        let b = ScheduledJob::new("b", "", "* * * * *", serde_json::json!({}));
        store.insert_scheduled_job(&a).await.unwrap();
        store.insert_scheduled_job(&b).await.unwrap();

        store.set_enabled(a.id, false).await.unwrap();

        let active = store.list_scheduled_jobs(true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);
        assert_eq!(store.list_scheduled_jobs(false).await.unwrap().len(), 2);

        store.delete_scheduled_job(a.id).await.unwrap();
        assert!(store.get_scheduled_job(a.id).await.unwrap().is_none());
        assert!(matches!(
            store.delete_scheduled_job(a.id).await,
            Err(JobStoreError::NotFound(id)) if id == a.id
        ));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = ScheduledJob::new("a", "", "@hourly", serde_json::json!({}));
        store.insert_scheduled_job(&job).await.unwrap();

        assert!(matches!(
            store.insert_scheduled_job(&job).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn update_last_run_requires_existing_job() {
        let store = InMemoryJobStore::new();
        let job = ScheduledJob::new("a", "", "@daily", serde_json::json!({}));
        store.insert_scheduled_job(&job).await.unwrap();

        let at = Utc::now();
        store
            .update_last_run(job.id, at, ExecutionStatus::Failed, Some("boom".to_string()))
            .await
            .unwrap();

        let stored = store.get_scheduled_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.last_run_at, Some(at));
        assert_eq!(stored.last_status, Some(ExecutionStatus::Failed));
        assert_eq!(stored.last_error.as_deref(), Some("boom"));

        let missing = ScheduledJobId::new();
        assert!(matches!(
            store
                .update_last_run(missing, at, ExecutionStatus::Success, None)
                .await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = InMemoryJobStore::new();
        let id = ScheduledJobId::new();
        let base = Utc::now();

        for offset in 0..5 {
            let at = base + chrono::Duration::seconds(offset);
            let entry = JobExecutionHistory::for_summary(
                id,
                at,
                at,
                0,
                BatchExecutionSummary::default(),
            );
            store.record_execution_history(&entry).await.unwrap();
        }
        let other = JobExecutionHistory::for_failure(ScheduledJobId::new(), base, base, 0, "x");
        store.record_execution_history(&other).await.unwrap();

        let rows = store.list_execution_history(id, 3).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].started_at, base + chrono::Duration::seconds(4));
        assert_eq!(rows[2].started_at, base + chrono::Duration::seconds(2));
    }
}
