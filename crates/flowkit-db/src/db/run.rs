use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use flowkit_core::models::{Run, RunStatus};

const RUN_COLUMNS: &str = r#"
    id,
    pipeline_id,
    pipeline_version,
    user_id,
    input_data,
    status,
    credits_consumed,
    error,
    started_at,
    finished_at,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct RunRepository {
    pool: PgPool,
}

impl RunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a run in `queued` status with validated input.
    #[tracing::instrument(skip(self, input_data))]
    pub async fn create_queued(
        &self,
        pipeline_id: Uuid,
        pipeline_version: i32,
        user_id: Uuid,
        input_data: serde_json::Value,
    ) -> Result<Run> {
        let run: Run = sqlx::query_as::<Postgres, Run>(&format!(
            r#"
            INSERT INTO runs (pipeline_id, pipeline_version, user_id, input_data, status)
            VALUES ($1, $2, $3, $4, 'queued')
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(pipeline_id)
        .bind(pipeline_version)
        .bind(user_id)
        .bind(input_data)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert run")?;

        tracing::info!(run_id = %run.id, pipeline_id = %pipeline_id, "Run created");
        Ok(run)
    }

    /// Record a run that failed before it could be enqueued (e.g. a schedule
    /// payload that no longer validates against the latest version).
    #[tracing::instrument(skip(self, input_data))]
    pub async fn create_failed(
        &self,
        pipeline_id: Uuid,
        pipeline_version: i32,
        user_id: Uuid,
        input_data: serde_json::Value,
        error: &str,
    ) -> Result<Run> {
        let run: Run = sqlx::query_as::<Postgres, Run>(&format!(
            r#"
            INSERT INTO runs (pipeline_id, pipeline_version, user_id, input_data, status, error, finished_at)
            VALUES ($1, $2, $3, $4, 'failed', $5, NOW())
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(pipeline_id)
        .bind(pipeline_version)
        .bind(user_id)
        .bind(input_data)
        .bind(error)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert failed run")?;

        tracing::warn!(run_id = %run.id, pipeline_id = %pipeline_id, error, "Run recorded as failed");
        Ok(run)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, run_id: Uuid) -> Result<Option<Run>> {
        let run: Option<Run> = sqlx::query_as::<Postgres, Run>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM runs
            WHERE id = $1
            "#
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch run")?;

        Ok(run)
    }

    /// Cheap status poll, used for the cooperative cancellation check between
    /// steps.
    #[tracing::instrument(skip(self))]
    pub async fn status(&self, run_id: Uuid) -> Result<Option<RunStatus>> {
        let status: Option<RunStatus> =
            sqlx::query_scalar::<Postgres, RunStatus>("SELECT status FROM runs WHERE id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch run status")?;

        Ok(status)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_by_pipeline(
        &self,
        pipeline_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Run>> {
        let runs: Vec<Run> = sqlx::query_as::<Postgres, Run>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM runs
            WHERE pipeline_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(pipeline_id)
        .bind(limit.min(1000))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        Ok(runs)
    }

    /// Conditional `queued → running` transition. Returns `None` when the run
    /// is not in `queued` state — the duplicate-delivery guard: a redelivered
    /// job for an already-progressed run claims nothing.
    #[tracing::instrument(skip(self))]
    pub async fn try_start(&self, run_id: Uuid) -> Result<Option<Run>> {
        let run: Option<Run> = sqlx::query_as::<Postgres, Run>(&format!(
            r#"
            UPDATE runs
            SET status = 'running',
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to start run")?;

        Ok(run)
    }

    /// Finalize a run as `succeeded`. Conditional on `running` so a
    /// cancellation that landed mid-execution is never overwritten.
    #[tracing::instrument(skip(self))]
    pub async fn mark_succeeded(&self, run_id: Uuid) -> Result<Option<Run>> {
        let run: Option<Run> = sqlx::query_as::<Postgres, Run>(&format!(
            r#"
            UPDATE runs
            SET status = 'succeeded',
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to mark run succeeded")?;

        if let Some(ref run) = run {
            tracing::info!(
                run_id = %run_id,
                credits_consumed = run.credits_consumed,
                "Run succeeded"
            );
        }
        Ok(run)
    }

    /// Finalize a run as `failed` with the terminal cause.
    #[tracing::instrument(skip(self))]
    pub async fn mark_failed(&self, run_id: Uuid, error: &str) -> Result<Option<Run>> {
        let run: Option<Run> = sqlx::query_as::<Postgres, Run>(&format!(
            r#"
            UPDATE runs
            SET status = 'failed',
                error = $2,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to mark run failed")?;

        if run.is_some() {
            tracing::error!(run_id = %run_id, error, "Run failed");
        }
        Ok(run)
    }

    /// External cancellation: only from `queued` or `running`. A queued run is
    /// finished immediately; a running one gets its `finished_at` when the
    /// executor notices at the next step boundary.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, run_id: Uuid) -> Result<Option<Run>> {
        let run: Option<Run> = sqlx::query_as::<Postgres, Run>(&format!(
            r#"
            UPDATE runs
            SET finished_at = CASE WHEN status = 'queued' THEN NOW() ELSE finished_at END,
                status = 'canceled',
                updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to cancel run")?;

        if run.is_some() {
            tracing::info!(run_id = %run_id, "Run canceled");
        }
        Ok(run)
    }

    /// Stamp `finished_at` on a canceled run once the executor has stopped.
    #[tracing::instrument(skip(self))]
    pub async fn finish_canceled(&self, run_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET finished_at = COALESCE(finished_at, NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status = 'canceled'
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("Failed to finish canceled run")?;

        Ok(())
    }

    /// Append a completed step's cost to the run's total. Only increases.
    #[tracing::instrument(skip(self))]
    pub async fn add_credits(&self, run_id: Uuid, credits: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET credits_consumed = credits_consumed + $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(credits)
        .execute(&self.pool)
        .await
        .context("Failed to add run credits")?;

        Ok(())
    }
}
