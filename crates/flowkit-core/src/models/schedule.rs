use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recurring trigger for a pipeline (database row).
///
/// `next_run_at` is a UTC-normalized instant even though the cron expression
/// is evaluated in `timezone`. The scheduler advances it exactly once per
/// trigger and never moves it backward; disabling stops advancement but
/// preserves history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Schedule {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    pub timezone: String,
    /// Template payload merged into each triggered run's input.
    pub input_data: serde_json::Value,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
