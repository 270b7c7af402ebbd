//! Step operation provider trait
//!
//! The seam between the executor and whatever actually performs a step
//! (a model invocation, an outbound HTTP call). The host wires its provider
//! in at construction; tests substitute a scripted fake.

use async_trait::async_trait;
use serde_json::Value;

use flowkit_core::models::StepSpec;
use flowkit_core::StepError;

/// Result of one step operation: the output later steps may reference, plus
/// the provider-reported token usage the credit accountant bills from.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub output: Value,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Performs one step's operation against resolved input.
///
/// Implementations must be cancel-safe under a caller-imposed timeout and
/// report failures through [`StepError`] so the executor can distinguish
/// retryable from terminal ones.
#[async_trait]
pub trait StepOperation: Send + Sync {
    async fn execute(&self, step: &StepSpec, input: &Value) -> Result<StepOutcome, StepError>;
}

/// Placeholder provider for deployments that have not wired a real one.
/// Every step fails with a descriptive, non-retryable configuration error.
pub struct NoopStepOperation;

#[async_trait]
impl StepOperation for NoopStepOperation {
    async fn execute(&self, step: &StepSpec, _input: &Value) -> Result<StepOutcome, StepError> {
        Err(StepError::unrecoverable(anyhow::anyhow!(
            "no step operation provider configured (step '{}')",
            step.id
        )))
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeStepOperation;

#[cfg(any(test, feature = "test-support"))]
mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type ScriptedResult = Result<StepOutcome, (String, bool)>;

    /// Scripted provider for tests. Each step id maps to a queue of outcomes
    /// consumed one per attempt; a step with an exhausted (or missing) script
    /// fails unrecoverably. Errors are `(message, recoverable)` pairs.
    #[derive(Default)]
    pub struct FakeStepOperation {
        scripts: Mutex<HashMap<String, Vec<ScriptedResult>>>,
        calls: AtomicUsize,
    }

    impl FakeStepOperation {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn succeed(self, step_id: &str, output: Value, tokens_in: u64, tokens_out: u64) -> Self {
            self.push(
                step_id,
                Ok(StepOutcome {
                    output,
                    tokens_in,
                    tokens_out,
                }),
            );
            self
        }

        pub fn fail_recoverable(self, step_id: &str, message: &str) -> Self {
            self.push(step_id, Err((message.to_string(), true)));
            self
        }

        pub fn fail_unrecoverable(self, step_id: &str, message: &str) -> Self {
            self.push(step_id, Err((message.to_string(), false)));
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn push(&self, step_id: &str, result: ScriptedResult) {
            self.scripts
                .lock()
                .unwrap()
                .entry(step_id.to_string())
                .or_default()
                .push(result);
        }
    }

    #[async_trait]
    impl StepOperation for FakeStepOperation {
        async fn execute(&self, step: &StepSpec, _input: &Value) -> Result<StepOutcome, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut scripts = self.scripts.lock().unwrap();
                scripts.get_mut(&step.id).filter(|s| !s.is_empty()).map(|s| s.remove(0))
            };
            match next {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err((message, true))) => Err(StepError::recoverable(anyhow::anyhow!(message))),
                Some(Err((message, false))) => {
                    Err(StepError::unrecoverable(anyhow::anyhow!(message)))
                }
                None => Err(StepError::unrecoverable(anyhow::anyhow!(
                    "no scripted outcome for step '{}'",
                    step.id
                ))),
            }
        }
    }
}
