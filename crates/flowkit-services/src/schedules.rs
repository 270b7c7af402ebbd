//! Schedule service: recurring triggers with creation-time cron validation.
//!
//! Both cron syntax and timezone validity are checked before anything is
//! stored, so invalid schedules never enter storage.

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use flowkit_core::cron;
use flowkit_core::models::Schedule;
use flowkit_core::AppError;
use flowkit_db::{PipelineRepository, ScheduleRepository};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateScheduleParams {
    #[validate(length(min = 1, max = 255, message = "name must be 1-255 characters"))]
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    pub timezone: String,
    /// Template payload merged into each triggered run's input.
    pub input_data: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct ScheduleService {
    schedules: ScheduleRepository,
    pipelines: PipelineRepository,
}

impl ScheduleService {
    pub fn new(schedules: ScheduleRepository, pipelines: PipelineRepository) -> Self {
        Self {
            schedules,
            pipelines,
        }
    }

    /// Create a schedule. The cron expression must parse, the timezone must
    /// resolve, and the expression must yield a real next tick.
    #[tracing::instrument(skip(self, params), fields(pipeline_id = %pipeline_id))]
    pub async fn create_schedule(
        &self,
        user_id: Uuid,
        pipeline_id: Uuid,
        params: CreateScheduleParams,
    ) -> Result<Schedule, AppError> {
        params.validate()?;
        self.owned_pipeline(user_id, pipeline_id).await?;

        cron::validate_expression(&params.cron_expression)?;
        cron::validate_timezone(&params.timezone)?;
        let next_run_at =
            cron::next_tick(&params.cron_expression, &params.timezone, Utc::now())?;

        let input_data = match params.input_data {
            Some(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
            Some(serde_json::Value::Null) | None => serde_json::json!({}),
            Some(_) => {
                return Err(AppError::BadRequest(
                    "Schedule input_data must be an object".into(),
                ))
            }
        };

        Ok(self
            .schedules
            .create(
                pipeline_id,
                user_id,
                params.name.trim(),
                params.description.as_deref(),
                &params.cron_expression,
                &params.timezone,
                input_data,
                next_run_at,
            )
            .await?)
    }

    /// Update the trigger definition, revalidating and recomputing the next
    /// tick.
    #[tracing::instrument(skip(self, params))]
    pub async fn update_schedule(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
        params: CreateScheduleParams,
    ) -> Result<Schedule, AppError> {
        params.validate()?;
        let schedule = self.owned_schedule(user_id, schedule_id).await?;

        cron::validate_expression(&params.cron_expression)?;
        cron::validate_timezone(&params.timezone)?;
        let next_run_at =
            cron::next_tick(&params.cron_expression, &params.timezone, Utc::now())?;

        self.schedules
            .update_definition(
                schedule.id,
                Some(params.name.trim()),
                params.description.as_deref(),
                &params.cron_expression,
                &params.timezone,
                params.input_data,
                next_run_at,
            )
            .await?
            .ok_or_else(|| AppError::NotFound("Schedule not found".into()))
    }

    /// Enable or disable a schedule. Enabling recomputes the next tick from
    /// now; disabling stops advancement but preserves history.
    #[tracing::instrument(skip(self))]
    pub async fn set_enabled(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
        enabled: bool,
    ) -> Result<Schedule, AppError> {
        let schedule = self.owned_schedule(user_id, schedule_id).await?;

        if enabled {
            let next_run_at = cron::next_tick(
                &schedule.cron_expression,
                &schedule.timezone,
                Utc::now(),
            )?;
            self.schedules
                .enable(schedule.id, next_run_at)
                .await?
                .ok_or_else(|| AppError::NotFound("Schedule not found".into()))
        } else {
            self.schedules.disable(schedule.id).await?;
            self.owned_schedule(user_id, schedule_id).await
        }
    }

    pub async fn list_schedules(
        &self,
        user_id: Uuid,
        pipeline_id: Uuid,
    ) -> Result<Vec<Schedule>, AppError> {
        self.owned_pipeline(user_id, pipeline_id).await?;
        Ok(self.schedules.list_by_pipeline(pipeline_id).await?)
    }

    async fn owned_pipeline(&self, user_id: Uuid, pipeline_id: Uuid) -> Result<(), AppError> {
        self.pipelines
            .get(pipeline_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| AppError::NotFound("Pipeline not found or access denied".into()))?;
        Ok(())
    }

    async fn owned_schedule(
        &self,
        user_id: Uuid,
        schedule_id: Uuid,
    ) -> Result<Schedule, AppError> {
        self.schedules
            .get(schedule_id)
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or_else(|| AppError::NotFound("Schedule not found or access denied".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_validation_rejects_empty_name() {
        let params = CreateScheduleParams {
            name: "".into(),
            description: None,
            cron_expression: "0 9 * * *".into(),
            timezone: "UTC".into(),
            input_data: None,
        };
        assert!(params.validate().is_err());
    }
}
