//! Flowkit worker infrastructure: the run queue consumer pool, the step
//! executor, and the schedule scanner.

pub mod context;
pub mod executor;
pub mod queue;
pub mod scheduler;
pub mod template;

pub use context::{NoopStepOperation, StepOperation, StepOutcome};
pub use executor::{RunExecutor, RunOutcome};
pub use queue::{RunQueue, RunQueueConfig};
pub use scheduler::{Scheduler, SchedulerConfig};

#[cfg(any(test, feature = "test-support"))]
pub use context::FakeStepOperation;
