//! Persisted scheduler records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use resaleops_core::{ExecutionId, ScheduledJobId};

use crate::jobs::BatchExecutionSummary;

/// Outcome of one scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    /// Reserved for rows written by external triggers that enforce their own
    /// run deadline; runs recorded by the scheduler are `success` or `failed`.
    Timeout,
}

impl ExecutionStatus {
    /// `Success` iff the batch had no failed and no timed-out jobs.
    pub fn from_summary(summary: &BatchExecutionSummary) -> Self {
        if summary.is_success() {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A named, durable job definition.
///
/// `cron_schedule` is stored verbatim for an external trigger; `next_run_at` is
/// written by that trigger, never computed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: ScheduledJobId,
    pub name: String,
    pub description: String,
    pub cron_schedule: String,
    pub is_enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<ExecutionStatus>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: JsonValue,
}

impl ScheduledJob {
    /// A freshly registered (and enabled) definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        cron_schedule: impl Into<String>,
        metadata: JsonValue,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ScheduledJobId::new(),
            name: name.into(),
            description: description.into(),
            cron_schedule: cron_schedule.into(),
            is_enabled: true,
            last_run_at: None,
            next_run_at: None,
            last_status: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            metadata,
        }
    }
}

/// One row per scheduled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionHistory {
    pub id: ExecutionId,
    pub scheduled_job_id: ScheduledJobId,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: ExecutionStatus,
    pub summary: BatchExecutionSummary,
    pub error: Option<String>,
}

impl JobExecutionHistory {
    /// History entry for a run whose batch executed.
    pub fn for_summary(
        scheduled_job_id: ScheduledJobId,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        summary: BatchExecutionSummary,
    ) -> Self {
        let status = ExecutionStatus::from_summary(&summary);
        let error = match status {
            ExecutionStatus::Success => None,
            _ => summary.first_error().map(str::to_string),
        };
        Self {
            id: ExecutionId::new(),
            scheduled_job_id,
            started_at,
            completed_at,
            duration_ms,
            status,
            summary,
            error,
        }
    }

    /// History entry for a run that failed before (or outside) the batch.
    pub fn for_failure(
        scheduled_job_id: ScheduledJobId,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            scheduled_job_id,
            started_at,
            completed_at,
            duration_ms,
            status: ExecutionStatus::Failed,
            summary: BatchExecutionSummary::default(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_jobs_start_enabled_and_unrun() {
        let job = ScheduledJob::new("nightly-relist", "", "0 3 * * *", serde_json::json!({}));

        assert!(job.is_enabled);
        assert!(job.last_run_at.is_none());
        assert!(job.next_run_at.is_none());
        assert!(job.last_status.is_none());
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn empty_batch_counts_as_success() {
        let now = Utc::now();
        let entry = JobExecutionHistory::for_summary(
            ScheduledJobId::new(),
            now,
            now,
            0,
            BatchExecutionSummary::default(),
        );

        assert_eq!(entry.status, ExecutionStatus::Success);
        assert!(entry.error.is_none());
    }

    #[test]
    fn failure_entries_carry_an_empty_summary() {
        let now = Utc::now();
        let entry =
            JobExecutionHistory::for_failure(ScheduledJobId::new(), now, now, 3, "factory exploded");

        assert_eq!(entry.status, ExecutionStatus::Failed);
        assert_eq!(entry.summary.total_jobs, 0);
        assert_eq!(entry.error.as_deref(), Some("factory exploded"));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Success).unwrap(),
            "\"success\""
        );
        assert_eq!("timeout".parse::<ExecutionStatus>(), Ok(ExecutionStatus::Timeout));
    }
}
