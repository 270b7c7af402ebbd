//! Pipeline definition models
//!
//! A pipeline is a named container; each published version is an immutable
//! document holding the input schema and the ordered step list. Edits create
//! a new version, never mutate a published one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validation::InputSchema;

/// Pipeline container (database row)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Pipeline {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable published version of a pipeline (database row).
/// `steps` and `input_schema` are stored as JSONB; use [`PipelineVersion::parsed_steps`]
/// and [`PipelineVersion::parsed_input_schema`] to materialize them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PipelineVersion {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub version: i32,
    pub input_schema: serde_json::Value,
    pub steps: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl PipelineVersion {
    pub fn parsed_steps(&self) -> Result<Vec<StepSpec>, serde_json::Error> {
        serde_json::from_value(self.steps.clone())
    }

    pub fn parsed_input_schema(&self) -> Result<InputSchema, serde_json::Error> {
        serde_json::from_value(self.input_schema.clone())
    }
}

/// Retry policy for a single step. Attempt counts are bounded; backoff between
/// attempts is computed by the executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Step-type-specific configuration. Tagged by `type` so each variant carries
/// only its own fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Language model invocation. `prompt` may reference run input variables
    /// and prior step outputs with `{{...}}` placeholders.
    ModelCall {
        model: String,
        prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        system: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_output_tokens: Option<u32>,
    },
    /// Outbound HTTP call performed by the step operation provider.
    HttpRequest {
        url: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
}

impl StepKind {
    /// Model name for pricing lookups; non-model steps have no token cost.
    pub fn model(&self) -> Option<&str> {
        match self {
            StepKind::ModelCall { model, .. } => Some(model),
            StepKind::HttpRequest { .. } => None,
        }
    }
}

/// One step within a pipeline version. `id` is stable across versions and
/// unique within one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_spec_deserializes_tagged_kind() {
        let spec: StepSpec = serde_json::from_value(json!({
            "id": "summarize",
            "name": "Summarize",
            "type": "model_call",
            "model": "gpt-4o-mini",
            "prompt": "Summarize: {{document}}",
            "retry": { "max_attempts": 2 },
            "timeout_seconds": 120
        }))
        .unwrap();
        assert_eq!(spec.id, "summarize");
        assert_eq!(spec.retry.max_attempts, 2);
        assert_eq!(spec.kind.model(), Some("gpt-4o-mini"));
    }

    #[test]
    fn retry_defaults_when_absent() {
        let spec: StepSpec = serde_json::from_value(json!({
            "id": "notify",
            "name": "Notify",
            "type": "http_request",
            "url": "https://example.com/hook",
            "method": "POST"
        }))
        .unwrap();
        assert_eq!(spec.retry, RetryPolicy::default());
        assert_eq!(spec.kind.model(), None);
        assert_eq!(spec.timeout_seconds, None);
    }

    #[test]
    fn unknown_step_type_is_rejected() {
        let result: Result<StepSpec, _> = serde_json::from_value(json!({
            "id": "x",
            "name": "X",
            "type": "teleport",
        }));
        assert!(result.is_err());
    }
}
