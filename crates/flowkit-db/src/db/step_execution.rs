use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use flowkit_core::models::StepExecution;

const STEP_EXECUTION_COLUMNS: &str = r#"
    id,
    run_id,
    step_id,
    step_index,
    status,
    input,
    output,
    cost_credits,
    attempt_count,
    error,
    started_at,
    finished_at,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct StepExecutionRepository {
    pool: PgPool,
}

impl StepExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the step's row in `pending`, or return the existing one — the
    /// unique `(run_id, step_id)` pair keeps redeliveries from duplicating
    /// rows.
    #[tracing::instrument(skip(self))]
    pub async fn upsert_pending(
        &self,
        run_id: Uuid,
        step_id: &str,
        step_index: i32,
    ) -> Result<StepExecution> {
        let execution: StepExecution = sqlx::query_as::<Postgres, StepExecution>(&format!(
            r#"
            INSERT INTO step_executions (run_id, step_id, step_index, status)
            VALUES ($1, $2, $3, 'pending')
            ON CONFLICT (run_id, step_id) DO UPDATE SET updated_at = NOW()
            RETURNING {STEP_EXECUTION_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(step_id)
        .bind(step_index)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert step execution")?;

        Ok(execution)
    }

    /// Transition `pending → running` with the resolved input.
    #[tracing::instrument(skip(self, input))]
    pub async fn mark_running(&self, id: Uuid, input: &serde_json::Value) -> Result<StepExecution> {
        let execution: StepExecution = sqlx::query_as::<Postgres, StepExecution>(&format!(
            r#"
            UPDATE step_executions
            SET status = 'running',
                input = $2,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {STEP_EXECUTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(input)
        .fetch_one(&self.pool)
        .await
        .context("Failed to mark step execution running")?;

        Ok(execution)
    }

    #[tracing::instrument(skip(self, output))]
    pub async fn mark_succeeded(
        &self,
        id: Uuid,
        output: &serde_json::Value,
        cost_credits: i64,
        attempt_count: i32,
    ) -> Result<StepExecution> {
        let execution: StepExecution = sqlx::query_as::<Postgres, StepExecution>(&format!(
            r#"
            UPDATE step_executions
            SET status = 'succeeded',
                output = $2,
                cost_credits = $3,
                attempt_count = $4,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {STEP_EXECUTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(output)
        .bind(cost_credits)
        .bind(attempt_count)
        .fetch_one(&self.pool)
        .await
        .context("Failed to mark step execution succeeded")?;

        tracing::info!(
            step_execution_id = %id,
            step_id = %execution.step_id,
            cost_credits,
            "Step succeeded"
        );
        Ok(execution)
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        attempt_count: i32,
    ) -> Result<StepExecution> {
        let execution: StepExecution = sqlx::query_as::<Postgres, StepExecution>(&format!(
            r#"
            UPDATE step_executions
            SET status = 'failed',
                error = $2,
                attempt_count = $3,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {STEP_EXECUTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(error)
        .bind(attempt_count)
        .fetch_one(&self.pool)
        .await
        .context("Failed to mark step execution failed")?;

        tracing::error!(
            step_execution_id = %id,
            step_id = %execution.step_id,
            error,
            "Step failed"
        );
        Ok(execution)
    }

    /// Record an undispatched step as `skipped` (run halted or canceled
    /// before it was reached).
    #[tracing::instrument(skip(self))]
    pub async fn insert_skipped(
        &self,
        run_id: Uuid,
        step_id: &str,
        step_index: i32,
    ) -> Result<StepExecution> {
        let execution: StepExecution = sqlx::query_as::<Postgres, StepExecution>(&format!(
            r#"
            INSERT INTO step_executions (run_id, step_id, step_index, status, finished_at)
            VALUES ($1, $2, $3, 'skipped', NOW())
            ON CONFLICT (run_id, step_id) DO UPDATE
                SET status = 'skipped',
                    finished_at = NOW(),
                    updated_at = NOW()
            RETURNING {STEP_EXECUTION_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(step_id)
        .bind(step_index)
        .fetch_one(&self.pool)
        .await
        .context("Failed to mark step execution skipped")?;

        Ok(execution)
    }

    /// All step executions of a run in declared order, for output resolution
    /// and inspection.
    #[tracing::instrument(skip(self))]
    pub async fn list_for_run(&self, run_id: Uuid) -> Result<Vec<StepExecution>> {
        let executions: Vec<StepExecution> = sqlx::query_as::<Postgres, StepExecution>(&format!(
            r#"
            SELECT {STEP_EXECUTION_COLUMNS}
            FROM step_executions
            WHERE run_id = $1
            ORDER BY step_index ASC
            "#
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list step executions")?;

        Ok(executions)
    }
}
