use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use flowkit_core::constants::{RUN_JOB_NAME, RUN_NOTIFY_CHANNEL};
use flowkit_core::models::{QueueJob, QueueStats};

const QUEUE_JOB_COLUMNS: &str = r#"
    id,
    job_name,
    run_id,
    status,
    attempts,
    error,
    enqueued_at,
    started_at,
    finished_at
"#;

#[derive(Clone)]
pub struct QueueJobRepository {
    pool: PgPool,
}

impl QueueJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a run for execution. The insert and the worker wake-up
    /// notification share one transaction; a failed notify is non-fatal
    /// because workers also poll.
    #[tracing::instrument(skip(self))]
    pub async fn enqueue(&self, run_id: Uuid) -> Result<QueueJob> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for enqueue")?;

        let job: QueueJob = sqlx::query_as::<Postgres, QueueJob>(&format!(
            r#"
            INSERT INTO queue_jobs (job_name, run_id, status)
            VALUES ($1, $2, 'queued')
            RETURNING {QUEUE_JOB_COLUMNS}
            "#
        ))
        .bind(RUN_JOB_NAME)
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert queue job")?;

        if let Err(e) = sqlx::query(&format!("SELECT pg_notify('{RUN_NOTIFY_CHANNEL}', '')"))
            .execute(&mut *tx)
            .await
        {
            tracing::warn!(
                error = %e,
                job_id = %job.id,
                "Failed to send pg_notify for new job, workers will discover it via polling"
            );
        }

        tx.commit()
            .await
            .context("Failed to commit enqueue transaction")?;

        tracing::info!(job_id = %job.id, run_id = %run_id, "Run enqueued");
        Ok(job)
    }

    /// Atomically claim the oldest queued job. `FOR UPDATE SKIP LOCKED` keeps
    /// concurrent worker pools from claiming the same job; delivery is
    /// at-least-once, so consumers must tolerate redelivery.
    #[tracing::instrument(skip(self))]
    pub async fn claim_next(&self) -> Result<Option<QueueJob>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let job: Option<QueueJob> = sqlx::query_as::<Postgres, QueueJob>(&format!(
            r#"
            SELECT {QUEUE_JOB_COLUMNS}
            FROM queue_jobs
            WHERE status = 'queued'
            ORDER BY enqueued_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to fetch next queue job")?;

        if let Some(job) = job {
            let claimed: QueueJob = sqlx::query_as::<Postgres, QueueJob>(&format!(
                r#"
                UPDATE queue_jobs
                SET status = 'active',
                    attempts = attempts + 1,
                    started_at = NOW()
                WHERE id = $1
                RETURNING {QUEUE_JOB_COLUMNS}
                "#
            ))
            .bind(job.id)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to claim queue job")?;

            tx.commit().await.context("Failed to commit claim")?;

            tracing::debug!(job_id = %claimed.id, run_id = %claimed.run_id, "Job claimed");
            Ok(Some(claimed))
        } else {
            tx.rollback().await.ok();
            Ok(None)
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_completed(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'completed',
                finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark queue job completed")?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'failed',
                error = $2,
                finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to mark queue job failed")?;

        Ok(())
    }

    /// Reap jobs whose worker died mid-run. Runs still `running` past the
    /// cutoff are failed (transitions stay one-directional; nothing is
    /// resurrected) and their jobs finalized; jobs whose run already reached a
    /// terminal status are completed. Returns the number of reaped runs.
    #[tracing::instrument(skip(self))]
    pub async fn reap_stale(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin reap transaction")?;

        let reaped = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'failed',
                error = 'worker lost: run exceeded its execution budget',
                finished_at = NOW(),
                updated_at = NOW()
            WHERE status = 'running'
              AND started_at < $1
              AND id IN (SELECT run_id FROM queue_jobs WHERE status = 'active')
            "#,
        )
        .bind(stale_before)
        .execute(&mut *tx)
        .await
        .context("Failed to fail stale runs")?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE queue_jobs qj
            SET status = CASE r.status WHEN 'succeeded' THEN 'completed'::queue_job_status
                                       ELSE 'failed'::queue_job_status END,
                error = r.error,
                finished_at = NOW()
            FROM runs r
            WHERE qj.run_id = r.id
              AND qj.status = 'active'
              AND r.status IN ('succeeded', 'failed', 'canceled')
              AND qj.started_at < $1
            "#,
        )
        .bind(stale_before)
        .execute(&mut *tx)
        .await
        .context("Failed to finalize stale queue jobs")?;

        tx.commit().await.context("Failed to commit reap")?;

        if reaped > 0 {
            tracing::warn!(reaped, "Reaped stale running runs");
        }
        Ok(reaped)
    }

    /// Prune finished jobs beyond the retention bounds, oldest first.
    #[tracing::instrument(skip(self))]
    pub async fn prune_finished(&self, keep_completed: i64, keep_failed: i64) -> Result<u64> {
        let completed = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE id IN (
                SELECT id FROM queue_jobs
                WHERE status = 'completed'
                ORDER BY finished_at DESC
                OFFSET $1
            )
            "#,
        )
        .bind(keep_completed)
        .execute(&self.pool)
        .await
        .context("Failed to prune completed jobs")?
        .rows_affected();

        let failed = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE id IN (
                SELECT id FROM queue_jobs
                WHERE status = 'failed'
                ORDER BY finished_at DESC
                OFFSET $1
            )
            "#,
        )
        .bind(keep_failed)
        .execute(&self.pool)
        .await
        .context("Failed to prune failed jobs")?
        .rows_affected();

        let pruned = completed + failed;
        if pruned > 0 {
            tracing::info!(pruned, "Pruned finished queue jobs");
        }
        Ok(pruned)
    }

    /// Queue depth by status, for health introspection.
    #[tracing::instrument(skip(self))]
    pub async fn stats(&self) -> Result<QueueStats> {
        let stats: QueueStats = sqlx::query_as::<Postgres, QueueStats>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'active') AS active,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM queue_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch queue stats")?;

        Ok(stats)
    }
}
