//! End-to-end orchestration tests over an isolated Postgres container.
//!
//! Run with `cargo test -- --ignored` (needs a Docker daemon).

mod helpers;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Months, Utc};
use serde_json::json;

use flowkit_core::models::{
    BillingInterval, Plan, RunStatus, StepExecutionStatus, SubscriptionStatus,
};
use flowkit_core::{AppError, ErrorMetadata};
use flowkit_services::{CreditService, HealthService, RunService, ScheduleService};
use flowkit_services::schedules::CreateScheduleParams;
use flowkit_worker::{FakeStepOperation, RunOutcome, Scheduler, SchedulerConfig};
use helpers::setup_test_app;

// 2M input + 1M output tokens on gpt-4o-mini: 90 cents, +20% markup = 108 credits.
const TOKENS_IN: u64 = 2_000_000;
const TOKENS_OUT: u64 = 1_000_000;
const STEP_COST: i64 = 108;

#[tokio::test]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn create_run_validates_input_and_applies_defaults() {
    let app = setup_test_app().await;
    let user = app.user_with_credits(Plan::Pro, 10_000).await;
    let (pipeline, _) = app.model_pipeline(&user, 1, 1).await;
    let service = RunService::new(app.runs.clone(), app.pipelines.clone(), app.jobs.clone());

    // Missing required variable: surfaced synchronously, nothing enqueued.
    let err = service
        .create_run(user.id, pipeline.id, json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_INPUT");
    assert!(matches!(&err, AppError::InvalidInput(issues) if issues[0].field == "topic"));
    assert_eq!(app.jobs.stats().await.unwrap().queued, 0);

    // Valid payload: defaults applied into the persisted input.
    let run = service
        .create_run(user.id, pipeline.id, json!({"topic": "rust"}))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.input_data["language"], json!("en"));
    assert_eq!(app.jobs.stats().await.unwrap().queued, 1);

    let health = HealthService::new(app.pool.clone(), app.jobs.clone(), app.heartbeats.clone())
        .check()
        .await
        .unwrap();
    assert!(health.database_ok);
    assert_eq!(health.queue.queued, 1);
}

#[tokio::test]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn run_executes_steps_in_order_and_bills_credits() {
    let app = setup_test_app().await;
    let user = app.user_with_credits(Plan::Pro, 10_000).await;
    let (pipeline, _) = app.model_pipeline(&user, 2, 1).await;
    let service = RunService::new(app.runs.clone(), app.pipelines.clone(), app.jobs.clone());

    let run = service
        .create_run(user.id, pipeline.id, json!({"topic": "rust"}))
        .await
        .unwrap();

    let provider = app.provider_all_succeed(&["s1", "s2"], TOKENS_IN, TOKENS_OUT);
    let executor = app.executor(Arc::new(provider));
    let outcome = executor.execute(run.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(RunStatus::Succeeded));

    let run = app.runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.credits_consumed, 2 * STEP_COST);
    assert!(run.started_at.is_some() && run.finished_at.is_some());

    let executions = app.steps.list_for_run(run.id).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert!(executions
        .iter()
        .all(|e| e.status == StepExecutionStatus::Succeeded && e.cost_credits == STEP_COST));
    assert_eq!(executions[0].step_index, 0);
    assert_eq!(executions[1].step_index, 1);

    let balance = app.users.credits_remaining(user.id).await.unwrap().unwrap();
    assert_eq!(balance, 10_000 - 2 * STEP_COST);
}

#[tokio::test]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn failed_third_step_halts_run_and_bills_only_completed_steps() {
    let app = setup_test_app().await;
    let user = app.user_with_credits(Plan::Pro, 10_000).await;
    let (pipeline, _) = app.model_pipeline(&user, 5, 2).await;
    let service = RunService::new(app.runs.clone(), app.pipelines.clone(), app.jobs.clone());

    let run = service
        .create_run(user.id, pipeline.id, json!({"topic": "rust"}))
        .await
        .unwrap();

    // Steps 1-2 succeed; step 3 fails both allowed attempts; 4-5 never run.
    let provider = FakeStepOperation::new()
        .succeed("s1", json!({"ok": 1}), TOKENS_IN, TOKENS_OUT)
        .succeed("s2", json!({"ok": 2}), TOKENS_IN, TOKENS_OUT)
        .fail_recoverable("s3", "provider briefly unavailable")
        .fail_recoverable("s3", "provider still unavailable");
    let executor = app.executor(Arc::new(provider));
    let outcome = executor.execute(run.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(RunStatus::Failed));

    let run = app.runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    // The terminal cause is the last attempt's error, not an intermediate one.
    assert!(run.error.as_deref().unwrap().contains("still unavailable"));
    assert_eq!(run.credits_consumed, 2 * STEP_COST);

    let executions = app.steps.list_for_run(run.id).await.unwrap();
    let statuses: Vec<_> = executions.iter().map(|e| (e.step_id.as_str(), e.status)).collect();
    assert_eq!(
        statuses,
        vec![
            ("s1", StepExecutionStatus::Succeeded),
            ("s2", StepExecutionStatus::Succeeded),
            ("s3", StepExecutionStatus::Failed),
            ("s4", StepExecutionStatus::Skipped),
            ("s5", StepExecutionStatus::Skipped),
        ]
    );
    assert_eq!(executions[2].attempt_count, 2);
}

#[tokio::test]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn redelivery_after_terminal_status_is_a_noop() {
    let app = setup_test_app().await;
    let user = app.user_with_credits(Plan::Pro, 10_000).await;
    let (pipeline, _) = app.model_pipeline(&user, 1, 1).await;
    let service = RunService::new(app.runs.clone(), app.pipelines.clone(), app.jobs.clone());

    let run = service
        .create_run(user.id, pipeline.id, json!({"topic": "rust"}))
        .await
        .unwrap();

    let provider = app.provider_all_succeed(&["s1"], TOKENS_IN, TOKENS_OUT);
    let executor = app.executor(Arc::new(provider));
    assert_eq!(
        executor.execute(run.id).await.unwrap(),
        RunOutcome::Finished(RunStatus::Succeeded)
    );
    let balance_after_first = app.users.credits_remaining(user.id).await.unwrap().unwrap();

    // Second delivery of the same run id: discarded, no new rows, no charge.
    assert_eq!(
        executor.execute(run.id).await.unwrap(),
        RunOutcome::DuplicateDelivery
    );
    assert_eq!(app.steps.list_for_run(run.id).await.unwrap().len(), 1);
    assert_eq!(
        app.users.credits_remaining(user.id).await.unwrap().unwrap(),
        balance_after_first
    );
}

#[tokio::test]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn insufficient_credits_fail_run_before_dispatch() {
    let app = setup_test_app().await;
    let user = app.user_with_credits(Plan::Free, 0).await;
    let (pipeline, _) = app.model_pipeline(&user, 2, 1).await;
    let service = RunService::new(app.runs.clone(), app.pipelines.clone(), app.jobs.clone());

    let run = service
        .create_run(user.id, pipeline.id, json!({"topic": "rust"}))
        .await
        .unwrap();

    let provider = FakeStepOperation::new(); // must never be called
    let provider = Arc::new(provider);
    let executor = app.executor(provider.clone());
    assert_eq!(
        executor.execute(run.id).await.unwrap(),
        RunOutcome::Finished(RunStatus::Failed)
    );
    assert_eq!(provider.calls(), 0);

    let run = app.runs.get(run.id).await.unwrap().unwrap();
    assert!(run.error.as_deref().unwrap().contains("insufficient credits"));
    assert_eq!(run.credits_consumed, 0);
    assert!(app
        .steps
        .list_for_run(run.id)
        .await
        .unwrap()
        .iter()
        .all(|e| e.status == StepExecutionStatus::Skipped));
}

#[tokio::test]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn concurrent_runs_never_drive_balance_negative() {
    let app = setup_test_app().await;
    // Exactly one step's worth of credits: of two concurrent runs, one must
    // lose the conditional debit.
    let user = app.user_with_credits(Plan::Pro, STEP_COST).await;
    let (pipeline, _) = app.model_pipeline(&user, 1, 1).await;
    let service = RunService::new(app.runs.clone(), app.pipelines.clone(), app.jobs.clone());

    let run_a = service
        .create_run(user.id, pipeline.id, json!({"topic": "a"}))
        .await
        .unwrap();
    let run_b = service
        .create_run(user.id, pipeline.id, json!({"topic": "b"}))
        .await
        .unwrap();

    let provider = Arc::new(
        FakeStepOperation::new()
            .succeed("s1", json!({"ok": true}), TOKENS_IN, TOKENS_OUT)
            .succeed("s1", json!({"ok": true}), TOKENS_IN, TOKENS_OUT),
    );
    let executor_a = app.executor(provider.clone());
    let executor_b = app.executor(provider);

    let (a, b) = tokio::join!(executor_a.execute(run_a.id), executor_b.execute(run_b.id));
    let outcomes = [a.unwrap(), b.unwrap()];

    let succeeded = outcomes
        .iter()
        .filter(|o| **o == RunOutcome::Finished(RunStatus::Succeeded))
        .count();
    let failed = outcomes
        .iter()
        .filter(|o| **o == RunOutcome::Finished(RunStatus::Failed))
        .count();
    assert_eq!((succeeded, failed), (1, 1));

    let balance = app.users.credits_remaining(user.id).await.unwrap().unwrap();
    assert_eq!(balance, 0, "balance must never go negative");
}

#[tokio::test]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn canceled_queued_run_is_not_executed() {
    let app = setup_test_app().await;
    let user = app.user_with_credits(Plan::Pro, 10_000).await;
    let (pipeline, _) = app.model_pipeline(&user, 1, 1).await;
    let service = RunService::new(app.runs.clone(), app.pipelines.clone(), app.jobs.clone());

    let run = service
        .create_run(user.id, pipeline.id, json!({"topic": "rust"}))
        .await
        .unwrap();
    let canceled = service.cancel_run(user.id, run.id).await.unwrap();
    assert_eq!(canceled.status, RunStatus::Canceled);

    // Delivery of the canceled run is a discarded duplicate.
    let provider = Arc::new(FakeStepOperation::new());
    let executor = app.executor(provider.clone());
    assert_eq!(
        executor.execute(run.id).await.unwrap(),
        RunOutcome::DuplicateDelivery
    );
    assert_eq!(provider.calls(), 0);
    assert_eq!(
        app.runs.get(run.id).await.unwrap().unwrap().status,
        RunStatus::Canceled
    );
}

#[tokio::test]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn scheduler_fires_once_and_catches_up_missed_ticks() {
    let app = setup_test_app().await;
    let user = app.user_with_credits(Plan::Pro, 10_000).await;
    let (pipeline, _) = app.model_pipeline(&user, 1, 1).await;

    // Hourly schedule three days stale: many missed ticks.
    let stale = Utc::now() - ChronoDuration::days(3);
    let schedule = app
        .schedules
        .create(
            pipeline.id,
            user.id,
            "hourly digest",
            None,
            "0 * * * *",
            "UTC",
            json!({"topic": "scheduled"}),
            stale,
        )
        .await
        .unwrap();

    let scheduler = Scheduler::new(
        app.schedules.clone(),
        app.pipelines.clone(),
        app.runs.clone(),
        app.jobs.clone(),
        SchedulerConfig::default(),
    );
    scheduler.scan_once().await.unwrap();

    // Exactly one run despite the backlog, and next_run_at jumped to the
    // future, never backward.
    let runs = app.runs.list_by_pipeline(pipeline.id, 10, 0).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Queued);
    assert_eq!(runs[0].input_data["topic"], json!("scheduled"));

    let advanced = app.schedules.get(schedule.id).await.unwrap().unwrap();
    let next = advanced.next_run_at.unwrap();
    assert!(next > Utc::now());
    assert!(next > stale);

    // A second scan finds nothing due.
    scheduler.scan_once().await.unwrap();
    assert_eq!(
        app.runs.list_by_pipeline(pipeline.id, 10, 0).await.unwrap().len(),
        1
    );
    assert_eq!(
        app.schedules.get(schedule.id).await.unwrap().unwrap().next_run_at,
        Some(next)
    );
}

#[tokio::test]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn schedule_creation_rejects_bad_cron_and_timezone() {
    let app = setup_test_app().await;
    let user = app.user_with_credits(Plan::Pro, 10_000).await;
    let (pipeline, _) = app.model_pipeline(&user, 1, 1).await;
    let service = ScheduleService::new(app.schedules.clone(), app.pipelines.clone());

    let err = service
        .create_schedule(
            user.id,
            pipeline.id,
            CreateScheduleParams {
                name: "bad cron".into(),
                description: None,
                cron_expression: "* * *".into(),
                timezone: "UTC".into(),
                input_data: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CRON_EXPRESSION");

    let err = service
        .create_schedule(
            user.id,
            pipeline.id,
            CreateScheduleParams {
                name: "bad tz".into(),
                description: None,
                cron_expression: "0 9 * * *".into(),
                timezone: "Mars/Olympus_Mons".into(),
                input_data: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_TIMEZONE");
}

#[tokio::test]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn billing_cycle_rolls_over_exactly_once_on_read() {
    let app = setup_test_app().await;
    let user = app.user_with_credits(Plan::Pro, 3).await;
    let stale_period_end = Utc::now() - ChronoDuration::days(40);
    app.users
        .update_subscription(
            user.id,
            Plan::Pro,
            Some("cus_test"),
            Some("sub_test"),
            Some(SubscriptionStatus::Active),
            Some(BillingInterval::Month),
            Some(stale_period_end),
            3,
        )
        .await
        .unwrap();

    let credits = CreditService::new(app.users.clone());
    assert_eq!(credits.balance(user.id).await.unwrap(), Plan::Pro.monthly_credits());

    // 40 days stale on a monthly interval: advanced by two months, now in the
    // future.
    let rolled = app.users.get(user.id).await.unwrap().unwrap();
    let period_end = rolled.stripe_current_period_end.unwrap();
    assert_eq!(
        period_end,
        stale_period_end.checked_add_months(Months::new(2)).unwrap()
    );
    assert!(period_end > Utc::now());

    // A second read changes nothing.
    assert_eq!(credits.balance(user.id).await.unwrap(), Plan::Pro.monthly_credits());
    assert_eq!(
        app.users
            .get(user.id)
            .await
            .unwrap()
            .unwrap()
            .stripe_current_period_end,
        Some(period_end)
    );
}
