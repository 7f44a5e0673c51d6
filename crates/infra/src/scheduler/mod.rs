//! Scheduler: persisted job definitions and on-demand runs.
//!
//! Cron expressions are stored for an external trigger, which reads the
//! enabled definitions and calls [`Scheduler::execute_job`].

pub mod service;
pub mod types;

pub use service::{Scheduler, SchedulerError};
pub use types::{ExecutionStatus, JobExecutionHistory, ScheduledJob};
