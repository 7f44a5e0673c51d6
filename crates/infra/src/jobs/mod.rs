//! Job engine: one-off and batch execution of async jobs.
//!
//! ## Design
//!
//! - Each attempt runs under its own deadline; failures retry with backoff,
//!   deadlines never retry
//! - Batches run all at once or through a bounded number of slots, in stable
//!   priority order
//! - Every terminal result is logged to a [`JobStore`]; store failures never
//!   change a result
//! - Queued and running jobs can be cancelled by id
//!
//! ## Components
//!
//! - `Job`: work closure plus timeout, retry policy, priority and hooks
//! - `JobExecutor`: runs jobs and batches, owns the live-job registry
//! - `JobStore`: persistence boundary (in-memory or Postgres)

pub mod executor;
pub mod postgres;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobExecutionLog, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, BatchExecutionSummary, BatchOptions, Job, JobContext, JobId, JobOutput,
    JobResult, JobStatus, Priority, RetryPolicy,
};
