//! Run queue consumer: worker pool, LISTEN/NOTIFY or polling, and dispatch.
//!
//! Shutdown: [`RunQueue::shutdown`] signals the pool to stop claiming; it does
//! not wait for in-flight runs. For graceful shutdown, give running steps time
//! to finish before process exit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::sleep;
use uuid::Uuid;

use flowkit_core::constants::{KEEP_COMPLETED_JOBS, KEEP_FAILED_JOBS, RUN_NOTIFY_CHANNEL};
use flowkit_core::models::QueueJob;
use flowkit_core::Config;
use flowkit_db::{QueueJobRepository, WorkerHeartbeatRepository};

use crate::executor::RunExecutor;

#[derive(Clone)]
pub struct RunQueueConfig {
    /// Bounded concurrency per worker process. A tunable, not a correctness
    /// constant; multiple processes may run for horizontal scale.
    pub max_concurrency: usize,
    pub poll_interval_ms: u64,
    /// Interval between stale-run reaper passes. 0 disables the reaper.
    pub stale_run_reap_interval_secs: u64,
    /// Budget after which a still-`running` run is considered lost.
    pub stale_run_grace_period_secs: i64,
    /// Interval between retention pruning passes. 0 disables pruning.
    pub queue_prune_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for RunQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            poll_interval_ms: 1000,
            stale_run_reap_interval_secs: 60,
            stale_run_grace_period_secs: 7200,
            queue_prune_interval_secs: 3600,
            heartbeat_interval_secs: 30,
        }
    }
}

impl From<&Config> for RunQueueConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrency: config.worker_max_concurrency,
            poll_interval_ms: config.worker_poll_interval_ms,
            stale_run_reap_interval_secs: config.stale_run_reap_interval_secs,
            stale_run_grace_period_secs: config.stale_run_grace_period_secs,
            queue_prune_interval_secs: config.queue_prune_interval_secs,
            heartbeat_interval_secs: config.heartbeat_interval_secs,
        }
    }
}

/// Consumer side of the durable run queue.
///
/// Claims jobs with at-least-once delivery and hands each run id to one
/// executor invocation. Job-level retry is disabled by policy: a whole-run
/// retry would re-run already-billed steps, so all retry logic lives inside
/// step execution.
pub struct RunQueue {
    jobs: QueueJobRepository,
    shutdown_tx: mpsc::Sender<()>,
}

impl RunQueue {
    /// Start the worker pool. When `pool` is `Some`, Postgres LISTEN/NOTIFY
    /// wakes the pool as soon as a run is enqueued, in addition to polling at
    /// `poll_interval_ms`.
    pub fn start(
        executor: RunExecutor,
        jobs: QueueJobRepository,
        heartbeats: WorkerHeartbeatRepository,
        config: RunQueueConfig,
        pool: Option<sqlx::PgPool>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let jobs_clone = jobs.clone();
        tokio::spawn(async move {
            Self::worker_pool(executor, jobs_clone, heartbeats, config, shutdown_rx, pool).await;
        });

        Self { jobs, shutdown_tx }
    }

    /// Submit a run id for execution. Exposed for collaborators that hold a
    /// queue handle rather than a repository.
    pub async fn enqueue(&self, run_id: Uuid) -> anyhow::Result<QueueJob> {
        self.jobs.enqueue(run_id).await
    }

    async fn worker_pool(
        executor: RunExecutor,
        jobs: QueueJobRepository,
        heartbeats: WorkerHeartbeatRepository,
        config: RunQueueConfig,
        mut shutdown_rx: mpsc::Receiver<()>,
        pool: Option<sqlx::PgPool>,
    ) {
        let use_listen = pool.is_some();
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let worker_id = format!("{}:{}", host, Uuid::new_v4());

        tracing::info!(
            worker_id = %worker_id,
            max_concurrency = config.max_concurrency,
            poll_interval_ms = config.poll_interval_ms,
            listen_notify = use_listen,
            "Run queue worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        let poll_interval = Duration::from_millis(config.poll_interval_ms);

        // Side loops stop when the pool does.
        let (stop_tx, _) = broadcast::channel::<()>(1);

        // Wake the main loop on NOTIFY instead of waiting out the poll
        // interval. The listener reconnects forever; polling covers gaps.
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(16);
        if let Some(pool) = pool {
            let tx = notify_tx.clone();
            let mut stop = stop_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.recv() => break,
                        connected = sqlx::postgres::PgListener::connect_with(&pool) => match connected {
                            Ok(mut listener) => {
                                if let Err(e) = listener.listen(RUN_NOTIFY_CHANNEL).await {
                                    tracing::warn!(error = %e, "LISTEN failed, will retry");
                                    sleep(Duration::from_secs(5)).await;
                                    continue;
                                }
                                loop {
                                    tokio::select! {
                                        _ = stop.recv() => return,
                                        received = listener.recv() => {
                                            if received.is_err() {
                                                break;
                                            }
                                            let _ = tx.send(()).await;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "PgListener connect failed, will retry");
                                sleep(Duration::from_secs(5)).await;
                            }
                        }
                    }
                }
            });
        }

        if config.stale_run_reap_interval_secs > 0 {
            let jobs_for_reaper = jobs.clone();
            let reap_interval = Duration::from_secs(config.stale_run_reap_interval_secs);
            let grace = config.stale_run_grace_period_secs;
            let mut stop = stop_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reap_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let cutoff = Utc::now() - chrono::Duration::seconds(grace);
                            if let Err(e) = jobs_for_reaper.reap_stale(cutoff).await {
                                tracing::error!(error = %e, "Stale run reaper failed");
                            }
                        }
                        _ = stop.recv() => break,
                    }
                }
            });
        }

        if config.queue_prune_interval_secs > 0 {
            let jobs_for_pruner = jobs.clone();
            let prune_interval = Duration::from_secs(config.queue_prune_interval_secs);
            let mut stop = stop_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(prune_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = jobs_for_pruner
                                .prune_finished(KEEP_COMPLETED_JOBS, KEEP_FAILED_JOBS)
                                .await
                            {
                                tracing::error!(error = %e, "Queue retention pruning failed");
                            }
                        }
                        _ = stop.recv() => break,
                    }
                }
            });
        }

        {
            let heartbeats = heartbeats.clone();
            let worker_id = worker_id.clone();
            let host = host.clone();
            let semaphore = semaphore.clone();
            let max = config.max_concurrency;
            let beat_interval = Duration::from_secs(config.heartbeat_interval_secs.max(1));
            let mut stop = stop_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(beat_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let active = (max - semaphore.available_permits()) as i32;
                            if let Err(e) = heartbeats.beat(&worker_id, &host, active).await {
                                tracing::warn!(error = %e, "Worker heartbeat failed");
                            }
                        }
                        _ = stop.recv() => break,
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!(worker_id = %worker_id, "Run queue worker pool shutting down");
                    break;
                }
                _ = notify_rx.recv() => {
                    Self::claim_and_dispatch_one(&executor, &jobs, &semaphore).await;
                }
                _ = sleep(poll_interval) => {
                    Self::claim_and_dispatch_one(&executor, &jobs, &semaphore).await;
                }
            }
        }

        let _ = stop_tx.send(());
        if let Err(e) = heartbeats.remove(&worker_id).await {
            tracing::warn!(error = %e, "Failed to remove worker heartbeat");
        }
        tracing::info!(worker_id = %worker_id, "Run queue worker pool stopped");
    }

    async fn claim_and_dispatch_one(
        executor: &RunExecutor,
        jobs: &QueueJobRepository,
        semaphore: &Arc<Semaphore>,
    ) {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!("No worker slots available, skipping claim");
                return;
            }
        };

        match jobs.claim_next().await {
            Ok(Some(job)) => {
                let executor = executor.clone();
                let jobs = jobs.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    Self::process_job(job, executor, jobs).await;
                });
            }
            Ok(None) => {
                drop(permit);
                tracing::trace!("No jobs available in queue");
            }
            Err(e) => {
                drop(permit);
                tracing::error!(error = %e, "Failed to claim job from queue");
            }
        }
    }

    #[tracing::instrument(skip(executor, jobs), fields(job_id = %job.id, run_id = %job.run_id))]
    async fn process_job(job: QueueJob, executor: RunExecutor, jobs: QueueJobRepository) {
        match executor.execute(job.run_id).await {
            Ok(outcome) => {
                tracing::debug!(?outcome, "Job processed");
                if let Err(e) = jobs.mark_completed(job.id).await {
                    tracing::error!(error = %e, "Failed to mark job completed");
                }
            }
            Err(e) => {
                // attempts = 1 by policy: no queue-level retry, the failure is
                // recorded and retained for inspection.
                tracing::error!(error = %e, "Job processing failed");
                if let Err(mark_err) = jobs.mark_failed(job.id, &e.to_string()).await {
                    tracing::error!(error = %mark_err, "Failed to mark job failed");
                }
            }
        }
    }

    /// Signal the pool to stop claiming new jobs and exit. Returns
    /// immediately; in-flight runs continue until they finish or time out.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating run queue shutdown");
        let _ = self.shutdown_tx.send(()).await;
    }
}
