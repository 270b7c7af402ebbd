use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use flowkit_core::models::Schedule;

const SCHEDULE_COLUMNS: &str = r#"
    id,
    pipeline_id,
    user_id,
    name,
    description,
    cron_expression,
    timezone,
    input_data,
    enabled,
    next_run_at,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct ScheduleRepository {
    pool: PgPool,
}

impl ScheduleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a schedule whose cron expression and timezone have already been
    /// validated; invalid schedules never enter storage.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self, input_data))]
    pub async fn create(
        &self,
        pipeline_id: Uuid,
        user_id: Uuid,
        name: &str,
        description: Option<&str>,
        cron_expression: &str,
        timezone: &str,
        input_data: serde_json::Value,
        next_run_at: DateTime<Utc>,
    ) -> Result<Schedule> {
        let schedule: Schedule = sqlx::query_as::<Postgres, Schedule>(&format!(
            r#"
            INSERT INTO schedules (
                pipeline_id, user_id, name, description, cron_expression,
                timezone, input_data, enabled, next_run_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8)
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(pipeline_id)
        .bind(user_id)
        .bind(name)
        .bind(description)
        .bind(cron_expression)
        .bind(timezone)
        .bind(input_data)
        .bind(next_run_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert schedule")?;

        tracing::info!(
            schedule_id = %schedule.id,
            pipeline_id = %pipeline_id,
            cron = %cron_expression,
            timezone = %timezone,
            "Schedule created"
        );
        Ok(schedule)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, schedule_id: Uuid) -> Result<Option<Schedule>> {
        let schedule: Option<Schedule> = sqlx::query_as::<Postgres, Schedule>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM schedules
            WHERE id = $1
            "#
        ))
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch schedule")?;

        Ok(schedule)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_by_pipeline(&self, pipeline_id: Uuid) -> Result<Vec<Schedule>> {
        let schedules: Vec<Schedule> = sqlx::query_as::<Postgres, Schedule>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM schedules
            WHERE pipeline_id = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list schedules")?;

        Ok(schedules)
    }

    /// Enabled schedules whose trigger instant has passed, oldest first.
    #[tracing::instrument(skip(self))]
    pub async fn due_schedules(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Schedule>> {
        let schedules: Vec<Schedule> = sqlx::query_as::<Postgres, Schedule>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM schedules
            WHERE enabled AND next_run_at IS NOT NULL AND next_run_at <= $1
            ORDER BY next_run_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to scan due schedules")?;

        Ok(schedules)
    }

    /// Optimistic advancement of `next_run_at`, keyed on the previously read
    /// value. Returns false when another scheduler instance claimed the tick
    /// first; the caller must then skip firing.
    #[tracing::instrument(skip(self))]
    pub async fn advance_next_run(
        &self,
        schedule_id: Uuid,
        previous: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET next_run_at = $3,
                updated_at = NOW()
            WHERE id = $1 AND next_run_at = $2 AND enabled
            "#,
        )
        .bind(schedule_id)
        .bind(previous)
        .bind(next)
        .execute(&self.pool)
        .await
        .context("Failed to advance schedule")?;

        Ok(result.rows_affected() == 1)
    }

    /// Disable a schedule that can no longer compute a next tick. Advancement
    /// stops; history is preserved.
    #[tracing::instrument(skip(self))]
    pub async fn disable(&self, schedule_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE schedules
            SET enabled = FALSE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(schedule_id)
        .execute(&self.pool)
        .await
        .context("Failed to disable schedule")?;

        tracing::warn!(schedule_id = %schedule_id, "Schedule disabled");
        Ok(())
    }

    /// Re-enable with a freshly computed trigger instant.
    #[tracing::instrument(skip(self))]
    pub async fn enable(&self, schedule_id: Uuid, next_run_at: DateTime<Utc>) -> Result<Option<Schedule>> {
        let schedule: Option<Schedule> = sqlx::query_as::<Postgres, Schedule>(&format!(
            r#"
            UPDATE schedules
            SET enabled = TRUE,
                next_run_at = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(schedule_id)
        .bind(next_run_at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to enable schedule")?;

        Ok(schedule)
    }

    /// Update the trigger definition. The caller revalidates the expression
    /// and timezone and supplies the recomputed `next_run_at`.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self, input_data))]
    pub async fn update_definition(
        &self,
        schedule_id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
        cron_expression: &str,
        timezone: &str,
        input_data: Option<serde_json::Value>,
        next_run_at: DateTime<Utc>,
    ) -> Result<Option<Schedule>> {
        let schedule: Option<Schedule> = sqlx::query_as::<Postgres, Schedule>(&format!(
            r#"
            UPDATE schedules
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                cron_expression = $4,
                timezone = $5,
                input_data = COALESCE($6, input_data),
                next_run_at = $7,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(schedule_id)
        .bind(name)
        .bind(description)
        .bind(cron_expression)
        .bind(timezone)
        .bind(input_data)
        .bind(next_run_at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update schedule")?;

        Ok(schedule)
    }
}
