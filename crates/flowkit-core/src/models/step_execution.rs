use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

/// Step execution status (matches database enum)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "step_execution_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum StepExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl Display for StepExecutionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            StepExecutionStatus::Pending => write!(f, "pending"),
            StepExecutionStatus::Running => write!(f, "running"),
            StepExecutionStatus::Succeeded => write!(f, "succeeded"),
            StepExecutionStatus::Failed => write!(f, "failed"),
            StepExecutionStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One step's outcome within a run (database row).
///
/// Exactly one row exists per `(run_id, step_id)`; `step_index` mirrors the
/// declared order and gives a total order for replay and inspection.
/// `attempt_count` records how many attempts the retry policy consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct StepExecution {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub step_index: i32,
    pub status: StepExecutionStatus,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub cost_credits: i64,
    pub attempt_count: i32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
