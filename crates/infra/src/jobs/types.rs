//! Core job types and policies.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Caller-chosen job identifier.
///
/// Ids key the executor's cancellation registry, so they must be unique among
/// jobs that are active at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, time-ordered id (`job_<uuidv7>`).
    pub fn generate() -> Self {
        Self(format!("job_{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Dispatch priority. Variant order is dispatch order: `Critical` starts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Linear backoff: base * retry
    Linear,
    /// Exponential backoff: base * 2^(retry - 1)
    Exponential,
}

/// Retry policy for failed (not timed out) attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries)
    pub max_retries: u32,
    /// Base delay between retries
    pub delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with linearly growing delays.
    pub fn linear(max_retries: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay to wait before the given retry (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Linear => self.delay.saturating_mul(retry).min(self.max_delay),
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(retry - 1);
                self.delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    /// Whether another retry is allowed after `retries_used` retries.
    pub fn should_retry(&self, retries_used: u32) -> bool {
        retries_used < self.max_retries
    }
}

/// Success value produced by a job's work.
pub type JobOutput = JsonValue;

type WorkFn = dyn Fn(JobContext) -> BoxFuture<'static, anyhow::Result<JobOutput>> + Send + Sync;
type SuccessHook = dyn Fn(&JobOutput) -> anyhow::Result<()> + Send + Sync;
type ErrorHook = dyn Fn(&str) -> anyhow::Result<()> + Send + Sync;

/// Per-attempt context handed to a job's work.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    attempt: u32,
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(job_id: JobId, attempt: u32, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            attempt,
            cancel,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// 0 for the first attempt, `n` for the n-th retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Cancelled once the executor stops waiting on this attempt
    /// (deadline, explicit cancel, or batch stop).
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the attempt is abandoned.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// One unit of work plus its execution policy.
///
/// Cheap to clone: the work and hooks are shared behind `Arc`s.
#[derive(Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub description: String,
    pub priority: Priority,
    /// Deadline for each attempt
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Opaque metadata, copied into results and logs
    pub metadata: JsonValue,
    work: Arc<WorkFn>,
    on_success: Option<Arc<SuccessHook>>,
    on_error: Option<Arc<ErrorHook>>,
}

impl Job {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    /// Create a job with default policy: medium priority, 300s timeout,
    /// 3 retries one second apart.
    pub fn new<F, Fut>(id: impl Into<JobId>, name: impl Into<String>, work: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JobOutput>> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            priority: Priority::default(),
            timeout: Self::DEFAULT_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            metadata: JsonValue::Object(Default::default()),
            work: Arc::new(move |ctx| work(ctx).boxed()),
            on_success: None,
            on_error: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry_policy.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_policy.delay = delay;
        self.retry_policy.max_delay = self.retry_policy.max_delay.max(delay);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Hook invoked once with the output when the job completes.
    pub fn on_success<H>(mut self, hook: H) -> Self
    where
        H: Fn(&JobOutput) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Hook invoked once with the final error message when retries are exhausted.
    pub fn on_error<H>(mut self, hook: H) -> Self
    where
        H: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub(crate) fn start(&self, ctx: JobContext) -> BoxFuture<'static, anyhow::Result<JobOutput>> {
        (self.work)(ctx)
    }

    pub(crate) fn success_hook(&self) -> Option<&SuccessHook> {
        self.on_success.as_deref()
    }

    pub(crate) fn error_hook(&self) -> Option<&ErrorHook> {
        self.on_error.as_deref()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .field("metadata", &self.metadata)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// Job execution status.
///
/// `Pending` and `Running` only describe jobs tracked by a live executor;
/// a returned [`JobResult`] always carries a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, waiting for a concurrency slot
    Pending,
    /// Work in flight (including retry back-off)
    Running,
    Completed,
    /// Work failed and retries are exhausted
    Failed,
    /// An attempt missed its deadline
    Timeout,
    /// Cancelled explicitly or abandoned by a stopping batch
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Statuses that trip `stop_on_first_error`.
    pub fn is_error(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "timeout" => Ok(JobStatus::Timeout),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Outcome of one job's whole attempt chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub job_name: String,
    pub status: JobStatus,
    pub result: Option<JobOutput>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Retries actually consumed
    pub retry_count: u32,
    pub metadata: JsonValue,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }

    /// Result for a job that was abandoned before its first attempt started.
    pub(crate) fn cancelled_before_start(job: &Job, reason: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            status: JobStatus::Cancelled,
            result: None,
            error: Some(reason.to_string()),
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            retry_count: 0,
            metadata: job.metadata.clone(),
        }
    }
}

/// Options for [`JobExecutor::execute_parallel`](super::JobExecutor::execute_parallel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Upper bound on jobs executing at once (`None` = all at once)
    pub max_concurrent: Option<usize>,
    /// Stop the batch on the first `failed` or `timeout` result
    pub stop_on_first_error: bool,
    /// Dispatch by priority (stable) instead of input order
    pub priority_order: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            stop_on_first_error: false,
            priority_order: true,
        }
    }
}

impl BatchOptions {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    pub fn with_stop_on_first_error(mut self, stop: bool) -> Self {
        self.stop_on_first_error = stop;
        self
    }

    pub fn with_priority_order(mut self, priority_order: bool) -> Self {
        self.priority_order = priority_order;
        self
    }
}

/// Aggregate over one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchExecutionSummary {
    pub total_jobs: usize,
    pub successful: usize,
    pub failed: usize,
    pub timeout: usize,
    pub cancelled: usize,
    /// Wall-clock span of the whole batch
    pub total_duration_ms: u64,
    /// Results in settlement order
    pub results: Vec<JobResult>,
}

impl BatchExecutionSummary {
    /// Tally results into a summary.
    pub fn from_results(results: Vec<JobResult>, total_duration_ms: u64) -> Self {
        let mut summary = Self {
            total_jobs: results.len(),
            total_duration_ms,
            ..Default::default()
        };

        for r in &results {
            match r.status {
                JobStatus::Completed => summary.successful += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Timeout => summary.timeout += 1,
                // Executor never returns non-terminal results; count them as
                // cancelled so the totals still add up.
                JobStatus::Cancelled | JobStatus::Pending | JobStatus::Running => {
                    summary.cancelled += 1
                }
            }
        }

        summary.results = results;
        summary
    }

    /// True when no job failed or timed out.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.timeout == 0
    }

    /// Error message of the first failed or timed-out result.
    pub fn first_error(&self) -> Option<&str> {
        self.results
            .iter()
            .filter(|r| r.status.is_error())
            .find_map(|r| r.error.as_deref())
    }
}
