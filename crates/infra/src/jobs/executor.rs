//! Job executor: per-job timeouts and retries, bounded parallel batches,
//! cooperative cancellation.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::JobStore;
use super::types::{
    BatchExecutionSummary, BatchOptions, Job, JobContext, JobId, JobOutput, JobResult, JobStatus,
};

const CANCELLED_REASON: &str = "job cancelled";
const BATCH_STOPPED_REASON: &str = "batch stopped after an earlier job failed";

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub batches: u64,
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub jobs_cancelled: u64,
    pub current_running: usize,
}

impl ExecutorStats {
    fn record(&mut self, status: JobStatus) {
        self.jobs_processed += 1;
        match status {
            JobStatus::Completed => self.jobs_completed += 1,
            JobStatus::Failed => self.jobs_failed += 1,
            JobStatus::Timeout => self.jobs_timed_out += 1,
            JobStatus::Cancelled | JobStatus::Pending | JobStatus::Running => {
                self.jobs_cancelled += 1
            }
        }
    }
}

#[derive(Debug)]
struct LiveJob {
    ticket: u64,
    token: CancellationToken,
    status: JobStatus,
}

/// Registry of jobs the executor currently tracks, keyed by job id.
///
/// Each registration gets a ticket so a settling job only removes its own
/// entry, even if the caller reused the id.
#[derive(Debug, Default)]
struct LiveJobs {
    next_ticket: u64,
    jobs: HashMap<JobId, LiveJob>,
}

/// Outcome of a single attempt.
enum Attempt {
    Succeeded(JobOutput),
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Terminal outcome of an attempt chain.
enum Outcome {
    Completed(JobOutput),
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Registry entry owned by a job's runner.
///
/// Dropping it untracks the job, so a runner future dropped before it
/// settles (outer timeout, aborted task) leaves nothing behind.
struct TrackGuard {
    live: Arc<Mutex<LiveJobs>>,
    stats: Arc<Mutex<ExecutorStats>>,
    id: JobId,
    ticket: u64,
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        if untrack(&self.live, &self.stats, &self.id, self.ticket) {
            debug!(job_id = %self.id, "job dropped before settling");
        }
    }
}

/// Identity kept per batch slot, so a lost task still yields a result.
struct Slot {
    job_id: JobId,
    job_name: String,
    metadata: serde_json::Value,
    ticket: u64,
}

/// Runs jobs with timeouts, retries and optional concurrency bounds, and
/// records every terminal result to a [`JobStore`].
///
/// Cheap to clone; clones share the store, registry and statistics.
pub struct JobExecutor<S: JobStore> {
    store: Arc<S>,
    live: Arc<Mutex<LiveJobs>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl<S: JobStore> Clone for JobExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            live: self.live.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<S: JobStore + 'static> JobExecutor<S> {
    /// Create a new executor writing results to `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            live: Arc::new(Mutex::new(LiveJobs::default())),
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        lock(&self.stats).clone()
    }

    /// Ids of jobs whose work is currently in flight.
    pub fn running_jobs(&self) -> Vec<JobId> {
        let live = lock(&self.live);
        let mut ids: Vec<_> = live
            .jobs
            .iter()
            .filter(|(_, j)| j.status == JobStatus::Running)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Transient status (`pending` or `running`) of a tracked job.
    pub fn job_status(&self, id: &JobId) -> Option<JobStatus> {
        lock(&self.live).jobs.get(id).map(|j| j.status)
    }

    pub fn is_tracked(&self, id: &JobId) -> bool {
        lock(&self.live).jobs.contains_key(id)
    }

    /// Cancel a tracked job (queued or running). Its result becomes `cancelled`.
    ///
    /// Returns `false` when no job with that id is tracked.
    pub fn cancel_job(&self, id: &JobId) -> bool {
        let live = lock(&self.live);
        match live.jobs.get(id) {
            Some(job) => {
                info!(job_id = %id, "cancelling job");
                job.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked job. Returns how many were signalled.
    pub fn cancel_all_jobs(&self) -> usize {
        let live = lock(&self.live);
        for job in live.jobs.values() {
            job.token.cancel();
        }
        if !live.jobs.is_empty() {
            info!(count = live.jobs.len(), "cancelling all jobs");
        }
        live.jobs.len()
    }

    /// Run one job to a terminal result (timeout, retries, hooks, logging).
    pub async fn run_job_with_timeout(&self, job: Job) -> JobResult {
        let token = CancellationToken::new();
        let guard = self.track(&job.id, token.clone());
        self.mark_running(&guard);
        self.run_tracked(&job, &token, guard).await
    }

    /// Run a batch of jobs and summarize the outcome.
    ///
    /// Individual failures never surface as errors; inspect the summary.
    /// With `stop_on_first_error`, the first `failed`/`timeout` result cancels
    /// every job that has not settled yet, whether queued or in flight.
    pub async fn execute_parallel(
        &self,
        jobs: Vec<Job>,
        options: BatchOptions,
    ) -> BatchExecutionSummary {
        let clock = Instant::now();
        let total = jobs.len();
        lock(&self.stats).batches += 1;

        if total == 0 {
            return BatchExecutionSummary::from_results(Vec::new(), 0);
        }

        let mut queue = jobs;
        if options.priority_order {
            // Stable: equal priorities keep input order.
            queue.sort_by_key(|j| j.priority);
        }

        let limit = options.max_concurrent.unwrap_or(total).clamp(1, total);
        info!(
            total_jobs = total,
            max_concurrent = limit,
            stop_on_first_error = options.stop_on_first_error,
            "executing job batch"
        );

        // Every job is tracked from submission so queued jobs can be cancelled too.
        let batch_token = CancellationToken::new();
        let mut slots = Vec::with_capacity(total);
        let mut pending = VecDeque::with_capacity(total);
        for (index, job) in queue.into_iter().enumerate() {
            let token = batch_token.child_token();
            let guard = self.track(&job.id, token.clone());
            slots.push(Slot {
                job_id: job.id.clone(),
                job_name: job.name.clone(),
                metadata: job.metadata.clone(),
                ticket: guard.ticket,
            });
            pending.push_back((index, job, token, guard));
        }

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks: JoinSet<(usize, JobResult)> = JoinSet::new();
        let mut results = Vec::with_capacity(total);
        let mut settled = vec![false; total];

        while let Some((index, job, token, guard)) = pending.pop_front() {
            let permit = loop {
                if let Ok(permit) = semaphore.clone().try_acquire_owned() {
                    break Some(permit);
                }
                // All slots busy: wait for any in-flight job to settle.
                match tasks.join_next().await {
                    Some(joined) => {
                        self.collect(joined, &mut results, &mut settled, &options, &batch_token)
                    }
                    None => break semaphore.clone().acquire_owned().await.ok(),
                }
            };

            if token.is_cancelled() || permit.is_none() {
                let reason = if batch_token.is_cancelled() {
                    BATCH_STOPPED_REASON
                } else {
                    CANCELLED_REASON
                };
                debug!(job_id = %job.id, reason, "skipping job before start");
                let result = JobResult::cancelled_before_start(&job, reason);
                self.settle(&job.id, guard.ticket, &result).await;
                settled[index] = true;
                results.push(result);
                continue;
            }

            self.mark_running(&guard);
            let executor = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = executor.run_tracked(&job, &token, guard).await;
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            self.collect(joined, &mut results, &mut settled, &options, &batch_token);
        }

        // A task that died without reporting still owes its job a result.
        for (index, slot) in slots.iter().enumerate() {
            if settled[index] {
                continue;
            }
            error!(job_id = %slot.job_id, "job task ended without a result");
            let now = Utc::now();
            let result = JobResult {
                job_id: slot.job_id.clone(),
                job_name: slot.job_name.clone(),
                status: JobStatus::Failed,
                result: None,
                error: Some("job task terminated unexpectedly".to_string()),
                started_at: now,
                completed_at: now,
                duration_ms: 0,
                retry_count: 0,
                metadata: slot.metadata.clone(),
            };
            self.settle(&slot.job_id, slot.ticket, &result).await;
            results.push(result);
        }

        let summary =
            BatchExecutionSummary::from_results(results, clock.elapsed().as_millis() as u64);
        info!(
            total_jobs = summary.total_jobs,
            successful = summary.successful,
            failed = summary.failed,
            timeout = summary.timeout,
            cancelled = summary.cancelled,
            total_duration_ms = summary.total_duration_ms,
            "job batch finished"
        );
        summary
    }

    fn collect(
        &self,
        joined: Result<(usize, JobResult), JoinError>,
        results: &mut Vec<JobResult>,
        settled: &mut [bool],
        options: &BatchOptions,
        batch_token: &CancellationToken,
    ) {
        match joined {
            Ok((index, result)) => {
                if options.stop_on_first_error
                    && result.status.is_error()
                    && !batch_token.is_cancelled()
                {
                    warn!(
                        job_id = %result.job_id,
                        status = %result.status,
                        "stopping batch after first error"
                    );
                    batch_token.cancel();
                }
                settled[index] = true;
                results.push(result);
            }
            Err(e) => error!(error = %e, "job task failed to join"),
        }
    }

    /// Attempt loop for a tracked job; settles (log, stats, untrack) before returning.
    async fn run_tracked(
        &self,
        job: &Job,
        token: &CancellationToken,
        guard: TrackGuard,
    ) -> JobResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut retries = 0u32;

        debug!(job_id = %job.id, job_name = %job.name, "job started");

        let outcome = loop {
            let attempt_token = token.child_token();
            let ctx = JobContext::new(job.id.clone(), retries, attempt_token.clone());
            let work = AssertUnwindSafe(job.start(ctx)).catch_unwind();

            let attempt = tokio::select! {
                biased;
                _ = token.cancelled() => Attempt::Cancelled,
                settled = tokio::time::timeout(job.timeout, work) => match settled {
                    Ok(Ok(Ok(output))) => Attempt::Succeeded(output),
                    Ok(Ok(Err(e))) => Attempt::Failed(format!("{e:#}")),
                    Ok(Err(panic)) => {
                        Attempt::Failed(format!("job panicked: {}", panic_detail(panic.as_ref())))
                    }
                    Err(_) => Attempt::TimedOut,
                },
            };
            // The attempt is over either way; let cooperative work observe it.
            attempt_token.cancel();

            match attempt {
                Attempt::Succeeded(output) => break Outcome::Completed(output),
                Attempt::TimedOut => break Outcome::TimedOut,
                Attempt::Cancelled => break Outcome::Cancelled,
                Attempt::Failed(message) => {
                    if !job.retry_policy.should_retry(retries) {
                        break Outcome::Failed(message);
                    }
                    let next = retries + 1;
                    let delay = job.retry_policy.delay_for_retry(next);
                    warn!(
                        job_id = %job.id,
                        retry = next,
                        max_retries = job.retry_policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "job attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break Outcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // Counted once the back-off is served, not when it is scheduled.
                    retries = next;
                }
            }
        };

        let (status, output, error) = match outcome {
            Outcome::Completed(output) => {
                if let Some(hook) = job.success_hook() {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| hook(&output))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(job_id = %job.id, error = %e, "success hook failed"),
                        Err(panic) => warn!(
                            job_id = %job.id,
                            panic = %panic_detail(panic.as_ref()),
                            "success hook panicked"
                        ),
                    }
                }
                (JobStatus::Completed, Some(output), None)
            }
            Outcome::Failed(message) => {
                if let Some(hook) = job.error_hook() {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| hook(message.as_str()))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(job_id = %job.id, error = %e, "error hook failed"),
                        Err(panic) => warn!(
                            job_id = %job.id,
                            panic = %panic_detail(panic.as_ref()),
                            "error hook panicked"
                        ),
                    }
                }
                (JobStatus::Failed, None, Some(message))
            }
            Outcome::TimedOut => (
                JobStatus::Timeout,
                None,
                Some(format!("job timed out after {}ms", job.timeout.as_millis())),
            ),
            Outcome::Cancelled => (JobStatus::Cancelled, None, Some(CANCELLED_REASON.to_string())),
        };

        let result = JobResult {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            status,
            result: output,
            error,
            started_at,
            completed_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            retry_count: retries,
            metadata: job.metadata.clone(),
        };

        self.settle(&job.id, guard.ticket, &result).await;
        result
    }

    /// Persist (best effort), count and untrack a terminal result.
    async fn settle(&self, id: &JobId, ticket: u64, result: &JobResult) {
        untrack(&self.live, &self.stats, id, ticket);
        lock(&self.stats).record(result.status);

        debug!(
            job_id = %result.job_id,
            status = %result.status,
            retry_count = result.retry_count,
            duration_ms = result.duration_ms,
            "job settled"
        );

        if let Err(e) = self.store.log_job_execution(result).await {
            warn!(job_id = %result.job_id, error = %e, "failed to log job execution");
        }
    }

    fn track(&self, id: &JobId, token: CancellationToken) -> TrackGuard {
        let mut live = lock(&self.live);
        let ticket = live.next_ticket;
        live.next_ticket += 1;
        if live.jobs.contains_key(id) {
            warn!(job_id = %id, "job id already tracked; cancellation will target the newest job");
        }
        live.jobs.insert(
            id.clone(),
            LiveJob {
                ticket,
                token,
                status: JobStatus::Pending,
            },
        );
        TrackGuard {
            live: self.live.clone(),
            stats: self.stats.clone(),
            id: id.clone(),
            ticket,
        }
    }

    fn mark_running(&self, guard: &TrackGuard) {
        let marked = {
            let mut live = lock(&self.live);
            match live.jobs.get_mut(&guard.id) {
                Some(job) if job.ticket == guard.ticket => {
                    job.status = JobStatus::Running;
                    true
                }
                _ => false,
            }
        };
        if marked {
            lock(&self.stats).current_running += 1;
        }
    }
}

/// Remove the entry if it still belongs to `ticket`, releasing its running
/// slot. Returns whether anything was removed.
fn untrack(
    live: &Mutex<LiveJobs>,
    stats: &Mutex<ExecutorStats>,
    id: &JobId,
    ticket: u64,
) -> bool {
    let removed = {
        let mut live = lock(live);
        if !live.jobs.get(id).is_some_and(|j| j.ticket == ticket) {
            return false;
        }
        live.jobs.remove(id)
    };
    if removed.as_ref().is_some_and(|j| j.status == JobStatus::Running) {
        let mut stats = lock(stats);
        stats.current_running = stats.current_running.saturating_sub(1);
    }
    removed.is_some()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
