//! Step executor
//!
//! Consumes a claimed run, executes its pipeline version's steps in order,
//! persists per-step results, bills completed steps, and finalizes the run.
//!
//! State machine per run: `queued → running → {succeeded | failed | canceled}`.
//! The `queued → running` transition is conditional and doubles as the
//! duplicate-delivery guard. Cancellation is cooperative: the canceled status
//! is observed between steps, never mid-operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use flowkit_core::billing::{cost_credits, pricing_for, ModelPricing};
use flowkit_core::models::{RunStatus, StepSpec};
use flowkit_db::{PipelineRepository, RunRepository, StepExecutionRepository, UserRepository};

use crate::context::{StepOperation, StepOutcome};
use crate::template::resolve_step_input;

/// Maximum delay in seconds before retrying a failed step attempt. Caps
/// exponential backoff so high attempt counts do not produce excessive waits.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Computes backoff in seconds for a given attempt number (exponential with cap).
#[inline]
pub(crate) fn compute_retry_backoff_seconds(attempt: u32) -> u64 {
    2_u64.saturating_pow(attempt).min(MAX_RETRY_BACKOFF_SECS)
}

/// What the executor did with a delivered run id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run was executed (or observed canceled) and reached this status.
    Finished(RunStatus),
    /// The run was not in `queued` state: a redelivered job for an
    /// already-progressed run, discarded without side effects.
    DuplicateDelivery,
}

enum Attempt {
    Succeeded(StepOutcome, i32),
    Failed { error: String, attempts: i32 },
}

/// Executes runs end to end. One invocation exclusively owns its run's
/// Run/StepExecution rows; the only cross-run shared state it touches is the
/// user's credit balance, via the atomic conditional debit.
#[derive(Clone)]
pub struct RunExecutor {
    runs: RunRepository,
    steps: StepExecutionRepository,
    pipelines: PipelineRepository,
    users: UserRepository,
    provider: Arc<dyn StepOperation>,
    default_step_timeout: Duration,
}

impl RunExecutor {
    pub fn new(
        runs: RunRepository,
        steps: StepExecutionRepository,
        pipelines: PipelineRepository,
        users: UserRepository,
        provider: Arc<dyn StepOperation>,
        default_step_timeout: Duration,
    ) -> Self {
        Self {
            runs,
            steps,
            pipelines,
            users,
            provider,
            default_step_timeout,
        }
    }

    /// Execute one delivered run id to a terminal status.
    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    pub async fn execute(&self, run_id: Uuid) -> Result<RunOutcome> {
        let Some(run) = self.runs.try_start(run_id).await? else {
            // Redelivery of a run that already progressed; at-least-once
            // delivery makes this normal. Log only, never user-visible.
            tracing::debug!(run_id = %run_id, "Duplicate delivery discarded");
            return Ok(RunOutcome::DuplicateDelivery);
        };

        let Some(version) = self
            .pipelines
            .get_version(run.pipeline_id, run.pipeline_version)
            .await?
        else {
            self.runs
                .mark_failed(run_id, "pipeline version no longer exists")
                .await?;
            return Ok(RunOutcome::Finished(RunStatus::Failed));
        };

        let step_specs = match version.parsed_steps() {
            Ok(steps) => steps,
            Err(e) => {
                self.runs
                    .mark_failed(run_id, &format!("pipeline steps failed to parse: {e}"))
                    .await?;
                return Ok(RunOutcome::Finished(RunStatus::Failed));
            }
        };

        let run_input = run.input_data.as_object().cloned().unwrap_or_default();
        let mut prior_outputs: HashMap<String, Value> = HashMap::new();

        for (index, step) in step_specs.iter().enumerate() {
            // Cooperative cancellation: observed at step boundaries only.
            if self.runs.status(run_id).await? == Some(RunStatus::Canceled) {
                self.skip_remaining(run_id, &step_specs, index).await?;
                self.runs.finish_canceled(run_id).await?;
                tracing::info!(run_id = %run_id, "Run canceled, remaining steps skipped");
                return Ok(RunOutcome::Finished(RunStatus::Canceled));
            }

            // Credit pre-check before every dispatch: multi-step runs can
            // exhaust the balance mid-flight. The read applies a lazy billing
            // rollover when one is due.
            let user = match self.users.get_with_rollover(run.user_id).await? {
                Some(user) => user,
                None => {
                    self.skip_remaining(run_id, &step_specs, index).await?;
                    self.runs.mark_failed(run_id, "user no longer exists").await?;
                    return Ok(RunOutcome::Finished(RunStatus::Failed));
                }
            };
            if user.credits_remaining <= 0 {
                let error = format!(
                    "insufficient credits: {} remaining before step '{}'",
                    user.credits_remaining, step.id
                );
                self.skip_remaining(run_id, &step_specs, index).await?;
                self.runs.mark_failed(run_id, &error).await?;
                return Ok(RunOutcome::Finished(RunStatus::Failed));
            }

            // Pricing is part of step configuration; an unknown model fails
            // before any tokens are spent.
            let pricing = match step.kind.model() {
                Some(model) => match pricing_for(model) {
                    Some(pricing) => Some(pricing),
                    None => {
                        let error = format!("unknown model '{model}' in step '{}'", step.id);
                        self.fail_step_and_run(&run.id, step, index as i32, &error, 0, &step_specs)
                            .await?;
                        return Ok(RunOutcome::Finished(RunStatus::Failed));
                    }
                },
                None => None,
            };

            let execution = self
                .steps
                .upsert_pending(run_id, &step.id, index as i32)
                .await?;

            let input = match resolve_step_input(step, &run_input, &prior_outputs) {
                Ok(input) => input,
                Err(e) => {
                    // Unresolvable references cannot improve on retry.
                    self.fail_step_and_run(
                        &run.id,
                        step,
                        index as i32,
                        &format!("input resolution failed: {e}"),
                        0,
                        &step_specs,
                    )
                    .await?;
                    return Ok(RunOutcome::Finished(RunStatus::Failed));
                }
            };
            self.steps.mark_running(execution.id, &input).await?;

            match self.attempt_step(step, &input).await {
                Attempt::Succeeded(outcome, attempts) => {
                    let cost = pricing
                        .map(|p: ModelPricing| {
                            cost_credits(outcome.tokens_in, outcome.tokens_out, &p)
                        })
                        .unwrap_or(0);

                    if cost > 0 && !self.users.try_debit_credits(run.user_id, cost).await? {
                        // The conditional debit is the arbiter under
                        // concurrent runs; the balance never goes negative.
                        let error = format!(
                            "insufficient credits: balance cannot cover {cost} credit cost of step '{}'",
                            step.id
                        );
                        self.steps
                            .mark_failed(execution.id, &error, attempts)
                            .await?;
                        self.skip_remaining(run_id, &step_specs, index + 1).await?;
                        self.runs.mark_failed(run_id, &error).await?;
                        return Ok(RunOutcome::Finished(RunStatus::Failed));
                    }

                    self.steps
                        .mark_succeeded(execution.id, &outcome.output, cost, attempts)
                        .await?;
                    self.runs.add_credits(run_id, cost).await?;
                    prior_outputs.insert(step.id.clone(), outcome.output);
                }
                Attempt::Failed { error, attempts } => {
                    self.steps
                        .mark_failed(execution.id, &error, attempts)
                        .await?;
                    self.skip_remaining(run_id, &step_specs, index + 1).await?;
                    self.runs
                        .mark_failed(run_id, &format!("step '{}' failed: {error}", step.id))
                        .await?;
                    return Ok(RunOutcome::Finished(RunStatus::Failed));
                }
            }
        }

        match self.runs.mark_succeeded(run_id).await? {
            Some(_) => Ok(RunOutcome::Finished(RunStatus::Succeeded)),
            None => {
                // A cancellation landed between the last step and
                // finalization; the conditional update refused to overwrite it.
                self.runs.finish_canceled(run_id).await?;
                Ok(RunOutcome::Finished(RunStatus::Canceled))
            }
        }
    }

    /// Invoke the provider under the step timeout, retrying recoverable
    /// failures with exponential backoff up to the step's attempt bound.
    async fn attempt_step(&self, step: &StepSpec, input: &Value) -> Attempt {
        let max_attempts = step.retry.max_attempts.max(1);
        let step_timeout = step
            .timeout_seconds
            .map(|s| Duration::from_secs(s.max(0) as u64))
            .unwrap_or(self.default_step_timeout);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = timeout(step_timeout, self.provider.execute(step, input)).await;

            let (error, recoverable) = match result {
                Ok(Ok(outcome)) => return Attempt::Succeeded(outcome, attempt as i32),
                Ok(Err(e)) => (e.to_string(), e.is_recoverable()),
                Err(_) => (
                    format!(
                        "step operation timed out after {}s",
                        step_timeout.as_secs()
                    ),
                    true,
                ),
            };

            tracing::warn!(
                step_id = %step.id,
                attempt,
                max_attempts,
                recoverable,
                error = %error,
                "Step attempt failed"
            );

            if !recoverable || attempt >= max_attempts {
                // The terminal cause is the last attempt's error, never an
                // intermediate retry's message.
                return Attempt::Failed {
                    error,
                    attempts: attempt as i32,
                };
            }
            sleep(Duration::from_secs(compute_retry_backoff_seconds(attempt))).await;
        }
    }

    /// Record the given step as failed, skip everything after it, and fail
    /// the run.
    async fn fail_step_and_run(
        &self,
        run_id: &Uuid,
        step: &StepSpec,
        index: i32,
        error: &str,
        attempts: i32,
        all_steps: &[StepSpec],
    ) -> Result<()> {
        let execution = self.steps.upsert_pending(*run_id, &step.id, index).await?;
        self.steps.mark_failed(execution.id, error, attempts).await?;
        self.skip_remaining(*run_id, all_steps, (index + 1) as usize)
            .await?;
        self.runs
            .mark_failed(*run_id, &format!("step '{}' failed: {error}", step.id))
            .await?;
        Ok(())
    }

    /// Mark every step from `from_index` on as skipped.
    async fn skip_remaining(
        &self,
        run_id: Uuid,
        steps: &[StepSpec],
        from_index: usize,
    ) -> Result<()> {
        for (offset, step) in steps.iter().enumerate().skip(from_index) {
            self.steps
                .insert_skipped(run_id, &step.id, offset as i32)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(compute_retry_backoff_seconds(1), 2);
        assert_eq!(compute_retry_backoff_seconds(2), 4);
        assert_eq!(compute_retry_backoff_seconds(3), 8);
        assert_eq!(compute_retry_backoff_seconds(8), 256);
        assert_eq!(compute_retry_backoff_seconds(9), MAX_RETRY_BACKOFF_SECS);
        assert_eq!(compute_retry_backoff_seconds(20), MAX_RETRY_BACKOFF_SECS);
    }
}
