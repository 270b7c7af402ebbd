//! Schedule scanner: fires due schedules and advances their trigger instants.
//!
//! Safe to run from several processes at once: the optimistic conditional
//! advancement of `next_run_at` is the claim, so a due schedule fires exactly
//! once per tick no matter how many scheduler instances scan it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use flowkit_core::cron;
use flowkit_core::models::Schedule;
use flowkit_core::validation::validate_input;
use flowkit_db::{PipelineRepository, QueueJobRepository, RunRepository, ScheduleRepository};

/// Due schedules picked up per scan. Backlogs beyond this wait for the next
/// tick.
const SCAN_BATCH_SIZE: i64 = 100;

#[derive(Clone)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
        }
    }
}

pub struct Scheduler {
    schedules: ScheduleRepository,
    pipelines: PipelineRepository,
    runs: RunRepository,
    jobs: QueueJobRepository,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        schedules: ScheduleRepository,
        pipelines: PipelineRepository,
        runs: RunRepository,
        jobs: QueueJobRepository,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            schedules,
            pipelines,
            runs,
            jobs,
            config,
        }
    }

    /// Start the periodic scan loop. Returns a sender that stops the loop.
    pub fn start(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, mpsc::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let tick = Duration::from_secs(self.config.tick_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(
                tick_secs = self.config.tick_interval_secs,
                "Scheduler started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.scan_once().await {
                            tracing::error!(error = %e, "Scheduler scan failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Scheduler stopped");
                        break;
                    }
                }
            }
        });

        (handle, shutdown_tx)
    }

    /// One scan pass: fire every due schedule at most once.
    #[tracing::instrument(skip(self))]
    pub async fn scan_once(&self) -> Result<()> {
        let now = Utc::now();
        let due = self.schedules.due_schedules(now, SCAN_BATCH_SIZE).await?;
        for schedule in due {
            if let Err(e) = self.fire(&schedule).await {
                tracing::error!(
                    schedule_id = %schedule.id,
                    error = %e,
                    "Failed to fire schedule"
                );
            }
        }
        Ok(())
    }

    /// Fire one due schedule: claim its tick, then create and enqueue a run.
    ///
    /// Claim first — the conditional advancement is what prevents a second
    /// scheduler instance from double-firing. The advancement catches up past
    /// all missed ticks in one jump, so an outage produces a single run, not a
    /// backlog burst.
    async fn fire(&self, schedule: &Schedule) -> Result<()> {
        let now = Utc::now();
        let Some(previous) = schedule.next_run_at else {
            return Ok(());
        };

        let next = match cron::advance_past(
            &schedule.cron_expression,
            &schedule.timezone,
            previous,
            now,
        ) {
            Ok(next) => next,
            Err(e) => {
                // Should not happen given validation at creation, but
                // definitions can drift. Disabled and reported, never
                // silently dropped.
                tracing::error!(
                    schedule_id = %schedule.id,
                    cron = %schedule.cron_expression,
                    timezone = %schedule.timezone,
                    error = %e,
                    "Schedule no longer computes a next tick, disabling"
                );
                self.schedules.disable(schedule.id).await?;
                return Ok(());
            }
        };

        if !self
            .schedules
            .advance_next_run(schedule.id, previous, next)
            .await?
        {
            // Another scheduler instance claimed this tick.
            tracing::debug!(schedule_id = %schedule.id, "Tick already claimed");
            return Ok(());
        }

        let Some(version) = self.pipelines.latest_version(schedule.pipeline_id).await? else {
            tracing::error!(
                schedule_id = %schedule.id,
                pipeline_id = %schedule.pipeline_id,
                "Schedule points at a pipeline with no published version, disabling"
            );
            self.schedules.disable(schedule.id).await?;
            return Ok(());
        };

        // Merge the stored payload under the latest version's schema; defaults
        // apply exactly as they would for an ad-hoc run.
        let schema = version.parsed_input_schema()?;
        let raw = match &schedule.input_data {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        let outcome = validate_input(&schema, &raw);

        if !outcome.valid {
            // Schema drifted since the schedule was created. Validation errors
            // are never enqueued; the failed run leaves an audit trail.
            let issues = outcome
                .issues
                .iter()
                .map(|i| format!("{}: {}", i.field, i.message))
                .collect::<Vec<_>>()
                .join("; ");
            let error = format!("schedule input failed validation: {issues}");
            self.runs
                .create_failed(
                    schedule.pipeline_id,
                    version.version,
                    schedule.user_id,
                    Value::Object(outcome.data),
                    &error,
                )
                .await?;
            tracing::warn!(schedule_id = %schedule.id, error, "Scheduled run not enqueued");
            return Ok(());
        }

        let run = self
            .runs
            .create_queued(
                schedule.pipeline_id,
                version.version,
                schedule.user_id,
                Value::Object(outcome.data),
            )
            .await?;
        self.jobs.enqueue(run.id).await?;

        tracing::info!(
            schedule_id = %schedule.id,
            run_id = %run.id,
            next_run_at = %next,
            "Schedule fired"
        );
        Ok(())
    }
}
