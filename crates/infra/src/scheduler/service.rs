use std::future::Future;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use resaleops_core::{DomainError, ScheduledJobId, require_non_blank};

use super::types::{ExecutionStatus, JobExecutionHistory, ScheduledJob};
use crate::config::JobEngineConfig;
use crate::jobs::{BatchExecutionSummary, BatchOptions, Job, JobExecutor, JobStore, JobStoreError};

/// Scheduler error.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    /// The job factory failed; a failed history row was written first.
    #[error("job factory failed: {0}")]
    Factory(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Owns scheduled job definitions and runs them through a [`JobExecutor`].
pub struct Scheduler<S: JobStore + 'static> {
    executor: JobExecutor<S>,
    options: BatchOptions,
    history_limit: usize,
}

impl<S: JobStore + 'static> Scheduler<S> {
    /// Scheduler with default run options (10 slots, no early stop, priority order).
    pub fn new(executor: JobExecutor<S>) -> Self {
        Self::from_config(executor, &JobEngineConfig::default())
    }

    pub fn from_config(executor: JobExecutor<S>, config: &JobEngineConfig) -> Self {
        Self {
            executor,
            options: config.batch_options(),
            history_limit: config.history_limit,
        }
    }

    pub fn with_batch_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn executor(&self) -> &JobExecutor<S> {
        &self.executor
    }

    fn store(&self) -> &S {
        self.executor.store()
    }

    /// Persist a new, enabled definition. Starts no timer.
    #[instrument(skip(self, description, metadata), err)]
    pub async fn register_scheduled_job(
        &self,
        name: &str,
        description: &str,
        cron_schedule: &str,
        metadata: JsonValue,
    ) -> Result<ScheduledJobId, SchedulerError> {
        require_non_blank("name", name)?;
        require_non_blank("cron_schedule", cron_schedule)?;

        let job = ScheduledJob::new(name.trim(), description, cron_schedule.trim(), metadata);
        self.store().insert_scheduled_job(&job).await?;

        info!(scheduled_job_id = %job.id, name = %job.name, "registered scheduled job");
        Ok(job.id)
    }

    /// Build the job set with `factory`, run it, and leave a history trail.
    ///
    /// Only a factory failure is returned as an error, and only after a failed
    /// history row has been written. Store failures along the way are logged.
    pub async fn execute_job<F, Fut>(
        &self,
        id: ScheduledJobId,
        factory: F,
    ) -> Result<BatchExecutionSummary, SchedulerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<Job>>>,
    {
        let started_at = Utc::now();
        let clock = Instant::now();

        let jobs = match factory().await {
            Ok(jobs) => jobs,
            Err(e) => {
                let message = format!("{e:#}");
                error!(scheduled_job_id = %id, error = %message, "job factory failed");

                let completed_at = Utc::now();
                let entry = JobExecutionHistory::for_failure(
                    id,
                    started_at,
                    completed_at,
                    clock.elapsed().as_millis() as u64,
                    message.clone(),
                );
                self.record_run(&entry).await;
                return Err(SchedulerError::Factory(message));
            }
        };

        info!(scheduled_job_id = %id, jobs = jobs.len(), "running scheduled job");
        let summary = self.executor.execute_parallel(jobs, self.options.clone()).await;

        let entry = JobExecutionHistory::for_summary(
            id,
            started_at,
            Utc::now(),
            clock.elapsed().as_millis() as u64,
            summary,
        );
        self.record_run(&entry).await;

        info!(
            scheduled_job_id = %id,
            status = %entry.status,
            duration_ms = entry.duration_ms,
            "scheduled job finished"
        );
        Ok(entry.summary)
    }

    /// Write the history row and last-run metadata; failures are logged only.
    async fn record_run(&self, entry: &JobExecutionHistory) {
        let id = entry.scheduled_job_id;
        if let Err(e) = self.store().record_execution_history(entry).await {
            warn!(scheduled_job_id = %id, error = %e, "failed to record execution history");
        }
        if let Err(e) = self
            .store()
            .update_last_run(id, entry.started_at, entry.status, entry.error.clone())
            .await
        {
            warn!(scheduled_job_id = %id, error = %e, "failed to update last run");
        }
    }

    #[instrument(skip(self), err)]
    pub async fn toggle_job_enabled(
        &self,
        id: ScheduledJobId,
        enabled: bool,
    ) -> Result<(), SchedulerError> {
        self.store().set_enabled(id, enabled).await?;
        info!(scheduled_job_id = %id, enabled, "toggled scheduled job");
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn delete_scheduled_job(&self, id: ScheduledJobId) -> Result<(), SchedulerError> {
        self.store().delete_scheduled_job(id).await?;
        info!(scheduled_job_id = %id, "deleted scheduled job");
        Ok(())
    }

    pub async fn get_scheduled_job(
        &self,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>, SchedulerError> {
        Ok(self.store().get_scheduled_job(id).await?)
    }

    /// Enabled definitions, oldest first. This is what a trigger polls.
    pub async fn get_active_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        Ok(self.store().list_scheduled_jobs(true).await?)
    }

    /// Every definition, enabled or not, with its last-run metadata.
    pub async fn get_all_job_status(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        Ok(self.store().list_scheduled_jobs(false).await?)
    }

    /// History of one definition, newest first; `None` uses the configured limit.
    pub async fn get_execution_history(
        &self,
        id: ScheduledJobId,
        limit: Option<usize>,
    ) -> Result<Vec<JobExecutionHistory>, SchedulerError> {
        let limit = limit.unwrap_or(self.history_limit);
        Ok(self.store().list_execution_history(id, limit).await?)
    }
}
