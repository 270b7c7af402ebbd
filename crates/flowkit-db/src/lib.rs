//! Flowkit Database Layer
//!
//! Repositories for the orchestration data model: pipelines and their
//! versions, runs, step executions, schedules, the durable run queue, users,
//! and worker heartbeats. Point lookups by id, filtered scans for due
//! schedules, and the atomic conditional updates the concurrency model
//! requires (credit decrement, schedule advancement) all live here.

pub mod db;
pub mod pool;

pub use db::{
    PipelineRepository, QueueJobRepository, RunRepository, ScheduleRepository,
    StepExecutionRepository, UserRepository, WorkerHeartbeatRepository,
};
pub use pool::{connect_pool, run_migrations};
