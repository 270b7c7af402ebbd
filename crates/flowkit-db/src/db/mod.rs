//! Database repositories for the data access layer
//!
//! Each repository owns a specific domain entity and provides CRUD plus the
//! specialized conditional-update queries the orchestration core depends on.

pub mod pipeline;
pub mod queue_job;
pub mod run;
pub mod schedule;
pub mod step_execution;
pub mod user;
pub mod worker_heartbeat;

pub use pipeline::PipelineRepository;
pub use queue_job::QueueJobRepository;
pub use run::RunRepository;
pub use schedule::ScheduleRepository;
pub use step_execution::StepExecutionRepository;
pub use user::UserRepository;
pub use worker_heartbeat::WorkerHeartbeatRepository;
