//! Job engine configuration, read from the environment.

use tracing::warn;

use crate::jobs::{BatchOptions, JobStoreError, PostgresJobStore};

const MAX_CONCURRENT_VAR: &str = "RESALEOPS_SCHEDULER_MAX_CONCURRENT";
const STOP_ON_FIRST_ERROR_VAR: &str = "RESALEOPS_SCHEDULER_STOP_ON_FIRST_ERROR";
const HISTORY_LIMIT_VAR: &str = "RESALEOPS_HISTORY_LIMIT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEngineConfig {
    /// Postgres connection string; `None` means the in-memory store.
    pub database_url: Option<String>,
    /// Concurrency bound for scheduled runs.
    pub scheduler_max_concurrent: usize,
    pub stop_on_first_error: bool,
    /// History rows returned when the caller gives no limit.
    pub history_limit: usize,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            scheduler_max_concurrent: 10,
            stop_on_first_error: false,
            history_limit: 50,
        }
    }
}

impl JobEngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to
    /// their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let scheduler_max_concurrent = parse_or(
            &lookup,
            MAX_CONCURRENT_VAR,
            defaults.scheduler_max_concurrent,
        );
        let stop_on_first_error =
            parse_or(&lookup, STOP_ON_FIRST_ERROR_VAR, defaults.stop_on_first_error);
        let history_limit = parse_or(&lookup, HISTORY_LIMIT_VAR, defaults.history_limit);

        Self {
            database_url,
            scheduler_max_concurrent,
            stop_on_first_error,
            history_limit,
        }
    }

    /// Batch options used for scheduled runs.
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions::default()
            .with_max_concurrent(self.scheduler_max_concurrent)
            .with_stop_on_first_error(self.stop_on_first_error)
    }

    /// Connect the Postgres store and apply its schema, if a database is configured.
    pub async fn postgres_store(&self) -> Result<Option<PostgresJobStore>, JobStoreError> {
        let Some(url) = &self.database_url else {
            return Ok(None);
        };
        let store = PostgresJobStore::connect(url).await?;
        store.ensure_schema().await?;
        Ok(Some(store))
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = ?default, "invalid config value; using default");
            default
        }),
    }
}
