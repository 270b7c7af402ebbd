//! Health introspection: queue depth and worker liveness.

use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;

use flowkit_core::models::{QueueStats, WorkerHeartbeat};
use flowkit_core::AppError;
use flowkit_db::{QueueJobRepository, WorkerHeartbeatRepository};

/// A worker is considered live if it has beaten within this window (three
/// missed beats at the default interval).
const LIVENESS_WINDOW_SECS: i64 = 90;

#[derive(Debug, Serialize)]
pub struct Health {
    pub database_ok: bool,
    pub queue: QueueStats,
    pub workers: Vec<WorkerHeartbeat>,
}

#[derive(Clone)]
pub struct HealthService {
    pool: PgPool,
    jobs: QueueJobRepository,
    heartbeats: WorkerHeartbeatRepository,
}

impl HealthService {
    pub fn new(
        pool: PgPool,
        jobs: QueueJobRepository,
        heartbeats: WorkerHeartbeatRepository,
    ) -> Self {
        Self {
            pool,
            jobs,
            heartbeats,
        }
    }

    pub async fn check(&self) -> Result<Health, AppError> {
        let database_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok();
        let queue = self.jobs.stats().await?;
        let workers = self
            .heartbeats
            .live_workers(Utc::now() - Duration::seconds(LIVENESS_WINDOW_SECS))
            .await?;

        Ok(Health {
            database_ok,
            queue,
            workers,
        })
    }
}
