//! Pipeline service: CRUD and version publishing with validation.

use std::collections::HashSet;

use uuid::Uuid;

use flowkit_core::constants::{MAX_NAME_LEN, MAX_PIPELINE_STEPS};
use flowkit_core::models::{Pipeline, PipelineVersion, StepSpec};
use flowkit_core::validation::InputSchema;
use flowkit_core::AppError;
use flowkit_db::PipelineRepository;

#[derive(Clone)]
pub struct PipelineService {
    pipelines: PipelineRepository,
}

impl PipelineService {
    pub fn new(pipelines: PipelineRepository) -> Self {
        Self { pipelines }
    }

    fn validate_name(name: &str) -> Result<(), AppError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(AppError::BadRequest("Pipeline name cannot be empty".into()));
        }
        if trimmed.len() > MAX_NAME_LEN {
            return Err(AppError::BadRequest(format!(
                "Pipeline name must be at most {} characters",
                MAX_NAME_LEN
            )));
        }
        Ok(())
    }

    fn validate_steps(steps: &serde_json::Value) -> Result<Vec<StepSpec>, AppError> {
        let parsed: Vec<StepSpec> = serde_json::from_value(steps.clone())
            .map_err(|e| AppError::BadRequest(format!("Invalid pipeline steps: {e}")))?;
        if parsed.is_empty() {
            return Err(AppError::BadRequest(
                "Pipeline must have at least one step".into(),
            ));
        }
        if parsed.len() > MAX_PIPELINE_STEPS {
            return Err(AppError::BadRequest(format!(
                "Pipeline may have at most {} steps",
                MAX_PIPELINE_STEPS
            )));
        }
        let mut seen = HashSet::new();
        for step in &parsed {
            if !seen.insert(step.id.as_str()) {
                return Err(AppError::BadRequest(format!(
                    "Duplicate step id '{}'",
                    step.id
                )));
            }
        }
        Ok(parsed)
    }

    pub async fn create_pipeline(
        &self,
        user_id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> Result<Pipeline, AppError> {
        Self::validate_name(name)?;
        Ok(self.pipelines.create(user_id, name.trim(), description).await?)
    }

    /// Publish a new immutable version after validating the step list and the
    /// declared input schema.
    pub async fn publish_version(
        &self,
        user_id: Uuid,
        pipeline_id: Uuid,
        input_schema: serde_json::Value,
        steps: serde_json::Value,
    ) -> Result<PipelineVersion, AppError> {
        self.owned_pipeline(user_id, pipeline_id).await?;
        Self::validate_steps(&steps)?;
        let _: InputSchema = serde_json::from_value(input_schema.clone())
            .map_err(|e| AppError::BadRequest(format!("Invalid input schema: {e}")))?;

        Ok(self
            .pipelines
            .publish_version(pipeline_id, input_schema, steps)
            .await?)
    }

    pub async fn latest_version(
        &self,
        user_id: Uuid,
        pipeline_id: Uuid,
    ) -> Result<Option<PipelineVersion>, AppError> {
        self.owned_pipeline(user_id, pipeline_id).await?;
        Ok(self.pipelines.latest_version(pipeline_id).await?)
    }

    pub(crate) async fn owned_pipeline(
        &self,
        user_id: Uuid,
        pipeline_id: Uuid,
    ) -> Result<Pipeline, AppError> {
        let pipeline = self
            .pipelines
            .get(pipeline_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| AppError::NotFound("Pipeline not found or access denied".into()))?;
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_empty_and_oversized_names() {
        assert!(PipelineService::validate_name("  ").is_err());
        assert!(PipelineService::validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(PipelineService::validate_name("Daily digest").is_ok());
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let steps = json!([
            {"id": "a", "name": "A", "type": "model_call", "model": "gpt-4o-mini", "prompt": "x"},
            {"id": "a", "name": "A again", "type": "model_call", "model": "gpt-4o-mini", "prompt": "y"},
        ]);
        let err = PipelineService::validate_steps(&steps).unwrap_err();
        assert!(err.to_string().contains("Duplicate step id"));
    }

    #[test]
    fn rejects_empty_step_list() {
        assert!(PipelineService::validate_steps(&json!([])).is_err());
    }

    #[test]
    fn accepts_well_formed_steps() {
        let steps = json!([
            {"id": "extract", "name": "Extract", "type": "model_call", "model": "gpt-4o", "prompt": "{{doc}}"},
            {"id": "notify", "name": "Notify", "type": "http_request", "url": "https://example.com", "method": "POST"},
        ]);
        let parsed = PipelineService::validate_steps(&steps).unwrap();
        assert_eq!(parsed.len(), 2);
    }
}
