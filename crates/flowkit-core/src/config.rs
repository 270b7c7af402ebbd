//! Configuration module
//!
//! Environment-driven configuration for the worker process and services:
//! database pool, run queue worker pool, scheduler tick, reaper, and
//! retention settings.

use std::env;

/// Application configuration, read once at startup and passed down by value.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub environment: String,

    // Run queue worker pool
    pub worker_max_concurrency: usize,
    pub worker_poll_interval_ms: u64,
    /// Default per-step timeout when the step spec does not set one.
    pub default_step_timeout_seconds: i64,

    // Scheduler
    pub scheduler_tick_seconds: u64,

    // Stale run reaper: fails runs that have been `running` longer than the
    // grace period (worst-case run budget). 0 disables the reaper.
    pub stale_run_reap_interval_secs: u64,
    pub stale_run_grace_period_secs: i64,

    // Retention pruning of finished queue jobs. 0 disables the pruner.
    pub queue_prune_interval_secs: u64,

    // Worker liveness heartbeat
    pub heartbeat_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        const MAX_CONNECTIONS: u32 = 20;
        const CONNECTION_TIMEOUT_SECS: u64 = 30;
        const WORKER_MAX_CONCURRENCY: usize = 5;
        const WORKER_POLL_INTERVAL_MS: u64 = 1000;
        const DEFAULT_STEP_TIMEOUT_SECS: i64 = 300;
        const SCHEDULER_TICK_SECS: u64 = 30;
        const STALE_RUN_REAP_INTERVAL_SECS: u64 = 60;
        const STALE_RUN_GRACE_PERIOD_SECS: i64 = 7200;
        const QUEUE_PRUNE_INTERVAL_SECS: u64 = 3600;
        const HEARTBEAT_INTERVAL_SECS: u64 = 30;

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| MAX_CONNECTIONS.to_string())
                .parse()
                .unwrap_or(MAX_CONNECTIONS),
            db_timeout_seconds: env::var("DB_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| CONNECTION_TIMEOUT_SECS.to_string())
                .parse()
                .unwrap_or(CONNECTION_TIMEOUT_SECS),
            environment,
            worker_max_concurrency: env::var("WORKER_MAX_CONCURRENCY")
                .unwrap_or_else(|_| WORKER_MAX_CONCURRENCY.to_string())
                .parse()
                .unwrap_or(WORKER_MAX_CONCURRENCY),
            worker_poll_interval_ms: env::var("WORKER_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| WORKER_POLL_INTERVAL_MS.to_string())
                .parse()
                .unwrap_or(WORKER_POLL_INTERVAL_MS),
            default_step_timeout_seconds: env::var("DEFAULT_STEP_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| DEFAULT_STEP_TIMEOUT_SECS.to_string())
                .parse()
                .unwrap_or(DEFAULT_STEP_TIMEOUT_SECS),
            scheduler_tick_seconds: env::var("SCHEDULER_TICK_SECONDS")
                .unwrap_or_else(|_| SCHEDULER_TICK_SECS.to_string())
                .parse()
                .unwrap_or(SCHEDULER_TICK_SECS),
            stale_run_reap_interval_secs: env::var("STALE_RUN_REAP_INTERVAL_SECS")
                .unwrap_or_else(|_| STALE_RUN_REAP_INTERVAL_SECS.to_string())
                .parse()
                .unwrap_or(STALE_RUN_REAP_INTERVAL_SECS),
            stale_run_grace_period_secs: env::var("STALE_RUN_GRACE_PERIOD_SECS")
                .unwrap_or_else(|_| STALE_RUN_GRACE_PERIOD_SECS.to_string())
                .parse()
                .unwrap_or(STALE_RUN_GRACE_PERIOD_SECS),
            queue_prune_interval_secs: env::var("QUEUE_PRUNE_INTERVAL_SECS")
                .unwrap_or_else(|_| QUEUE_PRUNE_INTERVAL_SECS.to_string())
                .parse()
                .unwrap_or(QUEUE_PRUNE_INTERVAL_SECS),
            heartbeat_interval_secs: env::var("HEARTBEAT_INTERVAL_SECS")
                .unwrap_or_else(|_| HEARTBEAT_INTERVAL_SECS.to_string())
                .parse()
                .unwrap_or(HEARTBEAT_INTERVAL_SECS),
        })
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_detection() {
        let mut config = Config {
            database_url: "postgres://localhost/flowkit".into(),
            db_max_connections: 20,
            db_timeout_seconds: 30,
            environment: "Production".into(),
            worker_max_concurrency: 5,
            worker_poll_interval_ms: 1000,
            default_step_timeout_seconds: 300,
            scheduler_tick_seconds: 30,
            stale_run_reap_interval_secs: 60,
            stale_run_grace_period_secs: 300,
            queue_prune_interval_secs: 3600,
            heartbeat_interval_secs: 30,
        };
        assert!(config.is_production());
        config.environment = "development".into();
        assert!(!config.is_production());
    }
}
