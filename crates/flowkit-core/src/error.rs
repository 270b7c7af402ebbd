//! Error types module
//!
//! All domain errors are unified under the `AppError` enum: validation,
//! configuration, billing, concurrency, and infrastructure failures. Callers
//! upstream (HTTP layer, webhook ingestion) map these onto their own response
//! shapes via [`ErrorMetadata`].
//!
//! The `Database` variant and `From<sqlx::Error>` are gated behind the `sqlx`
//! feature.

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

use crate::validation::ValidationIssue;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues like lost optimistic updates
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error reporting - how an error should be presented and handled.
pub trait ErrorMetadata {
    /// Machine-readable error code (e.g., "INSUFFICIENT_CREDITS")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (the operation can be retried)
    fn is_recoverable(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    /// Input payload failed schema validation. Surfaced synchronously to the
    /// caller; never enqueued.
    #[error("Input validation failed: {}", format_issues(.0))]
    InvalidInput(Vec<ValidationIssue>),

    #[error("Invalid cron expression: {0}")]
    InvalidCronExpression(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or broken configuration for a step operation (unknown model,
    /// absent secret). Terminal; not retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Insufficient credits: {remaining} remaining")]
    InsufficientCredits { remaining: i64 },

    /// Lost an optimistic conditional update race after exhausting re-reads.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("{}: {}", i.field, i.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON error: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        let issues = err
            .field_errors()
            .into_iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |e| ValidationIssue {
                    field: field.to_string(),
                    message: e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string()),
                })
            })
            .collect();
        AppError::InvalidInput(issues)
    }
}

impl From<crate::cron::CronError> for AppError {
    fn from(err: crate::cron::CronError) -> Self {
        use crate::cron::CronError;
        match err {
            CronError::InvalidExpression(msg) => AppError::InvalidCronExpression(msg),
            CronError::InvalidTimezone(tz) => AppError::InvalidTimezone(tz),
            CronError::NoUpcomingTick | CronError::CatchUpExceeded => {
                AppError::Configuration(err.to_string())
            }
        }
    }
}

/// Static metadata per variant: (error_code, recoverable, log_level).
fn static_metadata(err: &AppError) -> (&'static str, bool, LogLevel) {
    match err {
        AppError::Database(_) => ("DATABASE_ERROR", true, LogLevel::Error),
        AppError::InvalidInput(_) => ("INVALID_INPUT", false, LogLevel::Debug),
        AppError::InvalidCronExpression(_) => ("INVALID_CRON_EXPRESSION", false, LogLevel::Debug),
        AppError::InvalidTimezone(_) => ("INVALID_TIMEZONE", false, LogLevel::Debug),
        AppError::BadRequest(_) => ("BAD_REQUEST", false, LogLevel::Debug),
        AppError::NotFound(_) => ("NOT_FOUND", false, LogLevel::Debug),
        AppError::Configuration(_) => ("CONFIGURATION_ERROR", false, LogLevel::Error),
        AppError::InsufficientCredits { .. } => ("INSUFFICIENT_CREDITS", false, LogLevel::Warn),
        AppError::ConcurrencyConflict(_) => ("CONCURRENCY_CONFLICT", true, LogLevel::Warn),
        AppError::Internal(_) => ("INTERNAL_ERROR", true, LogLevel::Error),
        AppError::InternalWithSource { .. } => ("INTERNAL_ERROR", true, LogLevel::Error),
    }
}

impl ErrorMetadata for AppError {
    fn error_code(&self) -> &'static str {
        static_metadata(self).0
    }

    fn is_recoverable(&self) -> bool {
        static_metadata(self).1
    }

    fn log_level(&self) -> LogLevel {
        static_metadata(self).2
    }
}

impl AppError {
    /// Validation issues carried by this error, if any.
    pub fn validation_issues(&self) -> Option<&[ValidationIssue]> {
        match self {
            AppError::InvalidInput(issues) => Some(issues),
            _ => None,
        }
    }
}
