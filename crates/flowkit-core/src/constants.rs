//! Application-wide constants.

/// Queue job name for pipeline run execution. Jobs carry only the run id;
/// consumers re-read persisted state on delivery.
pub const RUN_JOB_NAME: &str = "pipeline-run";

/// Postgres LISTEN/NOTIFY channel signalled when a run is enqueued.
pub const RUN_NOTIFY_CHANNEL: &str = "flowkit_run_enqueued";

/// Completed queue jobs retained for inspection before pruning.
pub const KEEP_COMPLETED_JOBS: i64 = 1_000;

/// Failed queue jobs retained for inspection before pruning.
pub const KEEP_FAILED_JOBS: i64 = 5_000;

/// Hard cap on catch-up iterations when advancing a cron schedule or a billing
/// cycle past missed ticks. A loop that hits the cap indicates a
/// misconfiguration and is surfaced as an error instead of spinning forever.
pub const CATCH_UP_ITERATION_CAP: u32 = 10_000;

/// Maximum steps accepted in a published pipeline version.
pub const MAX_PIPELINE_STEPS: usize = 50;

/// Maximum length of pipeline and schedule names.
pub const MAX_NAME_LEN: usize = 255;
