use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

/// Queue job status (matches database enum)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "queue_job_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum QueueJobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl Display for QueueJobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            QueueJobStatus::Queued => write!(f, "queued"),
            QueueJobStatus::Active => write!(f, "active"),
            QueueJobStatus::Completed => write!(f, "completed"),
            QueueJobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Durable run-queue job (database row). Carries only the run id so a
/// redelivery always re-reads current persisted state, never stale in-flight
/// data. Job-level retry is disabled by policy (`attempts = 1`); retry lives
/// inside step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct QueueJob {
    pub id: Uuid,
    pub job_name: String,
    pub run_id: Uuid,
    pub status: QueueJobStatus,
    pub attempts: i32,
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Queue depth by status, for operational monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct QueueStats {
    pub queued: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// One worker pool's liveness record (database row).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub hostname: String,
    pub active_slots: i32,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}
