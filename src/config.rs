//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `CONVEYOR_DATABASE_URL`: PostgreSQL connection string (required)
//! - `CONVEYOR_SUBMITTER_WORKERS`: Submitter pool size (default: 2)
//! - `CONVEYOR_SCHEDULER_WORKERS`: Scheduler pool size (default: 2)
//! - `CONVEYOR_WORKER_WORKERS`: Worker pool size (default: 4)
//! - `CONVEYOR_RESULTER_WORKERS`: Resulter pool size (default: 2)
//! - `CONVEYOR_IDLE_BACKOFF_MS`: Scheduler sleep when the store is empty (default: 5000)
//! - `CONVEYOR_RECEIVE_WAIT_MS`: Bounded queue receive wait (default: 5000)
//! - `CONVEYOR_VISIBILITY_TIMEOUT_MS`: Redelivery window for unacknowledged messages (default: 30000)
//! - `CONVEYOR_SUPERVISOR_INTERVAL_MS`: Supervisor timer period (default: 5000)
//! - `CONVEYOR_STALE_TIMEOUT_SECS`: ACQUIRED age before a task counts as stale (default: 60)
//! - `CONVEYOR_REPAIR_BATCH_SIZE`: Max stale tasks repaired per sweep (default: 10)
//! - `CONVEYOR_SUCCESS_TTL_SECS`: Retention for SUCCESS rows (default: 3600)
//! - `CONVEYOR_CHAOS_PROBABILITY`: Synthetic failure probability, 0 disables (default: 0)

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Worker-pool size per stage
    pub submitter_workers: usize,
    pub scheduler_workers: usize,
    pub worker_workers: usize,
    pub resulter_workers: usize,

    /// Scheduler sleep when no task is eligible
    pub idle_backoff: Duration,

    /// Bounded wait for a queue receive before reporting no message
    pub receive_wait: Duration,

    /// How long an unacknowledged message stays invisible
    pub visibility_timeout: Duration,

    /// Period of both supervisor timer loops
    pub supervisor_interval: Duration,

    /// How long a task may sit ACQUIRED before it is presumed orphaned
    pub stale_timeout: Duration,

    /// Maximum stale tasks repaired per sweep
    pub repair_batch_size: i64,

    /// Retention for SUCCESS rows before deletion
    pub success_ttl: Duration,

    /// Probability of replacing a success with a synthetic failure.
    /// Must be 0 in production.
    pub chaos_probability: f64,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parsed(key, default_ms))
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parsed(key, default_secs))
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` if present, then reads from the environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("CONVEYOR_DATABASE_URL")
            .context("CONVEYOR_DATABASE_URL environment variable is required")?;

        Ok(Self {
            database_url,
            submitter_workers: env_parsed("CONVEYOR_SUBMITTER_WORKERS", 2),
            scheduler_workers: env_parsed("CONVEYOR_SCHEDULER_WORKERS", 2),
            worker_workers: env_parsed("CONVEYOR_WORKER_WORKERS", 4),
            resulter_workers: env_parsed("CONVEYOR_RESULTER_WORKERS", 2),
            idle_backoff: env_millis("CONVEYOR_IDLE_BACKOFF_MS", 5_000),
            receive_wait: env_millis("CONVEYOR_RECEIVE_WAIT_MS", 5_000),
            visibility_timeout: env_millis("CONVEYOR_VISIBILITY_TIMEOUT_MS", 30_000),
            supervisor_interval: env_millis("CONVEYOR_SUPERVISOR_INTERVAL_MS", 5_000),
            stale_timeout: env_secs("CONVEYOR_STALE_TIMEOUT_SECS", 60),
            repair_batch_size: env_parsed("CONVEYOR_REPAIR_BATCH_SIZE", 10),
            success_ttl: env_secs("CONVEYOR_SUCCESS_TTL_SECS", 3_600),
            chaos_probability: env_parsed("CONVEYOR_CHAOS_PROBABILITY", 0.0),
        })
    }

    /// Defaults with fast intervals, suitable for tests and local runs.
    pub fn for_tests() -> Self {
        Self {
            database_url: String::new(),
            submitter_workers: 2,
            scheduler_workers: 2,
            worker_workers: 2,
            resulter_workers: 2,
            idle_backoff: Duration::from_millis(20),
            receive_wait: Duration::from_millis(50),
            visibility_timeout: Duration::from_millis(500),
            supervisor_interval: Duration::from_millis(20),
            stale_timeout: Duration::from_secs(60),
            repair_batch_size: 10,
            success_ttl: Duration::from_secs(3_600),
            chaos_probability: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_fast() {
        let config = Config::for_tests();
        assert!(config.receive_wait < Duration::from_secs(1));
        assert_eq!(config.chaos_probability, 0.0);
    }

    #[test]
    fn env_parsing_falls_back_to_defaults() {
        assert_eq!(env_parsed("CONVEYOR_DOES_NOT_EXIST", 7usize), 7);
        assert_eq!(
            env_millis("CONVEYOR_DOES_NOT_EXIST", 250),
            Duration::from_millis(250)
        );
    }
}
