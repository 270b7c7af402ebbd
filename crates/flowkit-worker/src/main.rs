use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use flowkit_core::Config;
use flowkit_db::{
    connect_pool, run_migrations, PipelineRepository, QueueJobRepository, RunRepository,
    ScheduleRepository, StepExecutionRepository, UserRepository, WorkerHeartbeatRepository,
};
use flowkit_worker::{
    NoopStepOperation, RunExecutor, RunQueue, RunQueueConfig, Scheduler, SchedulerConfig,
    StepOperation,
};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    let pool = connect_pool(&config).await?;
    run_migrations(&pool).await?;

    let runs = RunRepository::new(pool.clone());
    let steps = StepExecutionRepository::new(pool.clone());
    let pipelines = PipelineRepository::new(pool.clone());
    let schedules = ScheduleRepository::new(pool.clone());
    let users = UserRepository::new(pool.clone());
    let jobs = QueueJobRepository::new(pool.clone());
    let heartbeats = WorkerHeartbeatRepository::new(pool.clone());

    // Deployments wire their model/HTTP provider here. The placeholder fails
    // every step with a descriptive configuration error.
    let provider: Arc<dyn StepOperation> = Arc::new(NoopStepOperation);

    let executor = RunExecutor::new(
        runs.clone(),
        steps,
        pipelines.clone(),
        users,
        provider,
        Duration::from_secs(config.default_step_timeout_seconds.max(1) as u64),
    );

    let queue = RunQueue::start(
        executor,
        jobs.clone(),
        heartbeats,
        RunQueueConfig::from(&config),
        Some(pool.clone()),
    );

    let scheduler = Arc::new(Scheduler::new(
        schedules,
        pipelines,
        runs,
        jobs,
        SchedulerConfig {
            tick_interval_secs: config.scheduler_tick_seconds,
        },
    ));
    let (scheduler_handle, scheduler_shutdown) = scheduler.start();

    tracing::info!("Flowkit worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    queue.shutdown().await;
    let _ = scheduler_shutdown.send(()).await;
    let _ = scheduler_handle.await;
    pool.close().await;

    Ok(())
}
