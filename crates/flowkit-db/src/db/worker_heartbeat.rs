use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};

use flowkit_core::models::WorkerHeartbeat;

#[derive(Clone)]
pub struct WorkerHeartbeatRepository {
    pool: PgPool,
}

impl WorkerHeartbeatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record that a worker pool is alive, with its currently occupied slots.
    #[tracing::instrument(skip(self))]
    pub async fn beat(&self, worker_id: &str, hostname: &str, active_slots: i32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (worker_id, hostname, active_slots)
            VALUES ($1, $2, $3)
            ON CONFLICT (worker_id) DO UPDATE
                SET active_slots = $3,
                    last_seen_at = NOW()
            "#,
        )
        .bind(worker_id)
        .bind(hostname)
        .bind(active_slots)
        .execute(&self.pool)
        .await
        .context("Failed to record worker heartbeat")?;

        Ok(())
    }

    /// Workers seen since the cutoff.
    #[tracing::instrument(skip(self))]
    pub async fn live_workers(&self, seen_after: DateTime<Utc>) -> Result<Vec<WorkerHeartbeat>> {
        let workers: Vec<WorkerHeartbeat> = sqlx::query_as::<Postgres, WorkerHeartbeat>(
            r#"
            SELECT worker_id, hostname, active_slots, started_at, last_seen_at
            FROM worker_heartbeats
            WHERE last_seen_at > $1
            ORDER BY worker_id
            "#,
        )
        .bind(seen_after)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list live workers")?;

        Ok(workers)
    }

    /// Remove a worker's record on clean shutdown.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, worker_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM worker_heartbeats WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove worker heartbeat")?;

        Ok(())
    }
}
