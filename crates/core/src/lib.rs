//! `resaleops-core` — shared building blocks for the job engine.
//!
//! Strongly-typed identifiers and the validation error model. No runtime or
//! storage concerns live here.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult, require_non_blank};
pub use id::{ExecutionId, ScheduledJobId};
