//! Infrastructure layer: job execution, scheduling, persistence, config.

pub mod config;
pub mod jobs;
pub mod scheduler;
