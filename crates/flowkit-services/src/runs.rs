//! Run service: validated run creation, enqueueing, and cancellation.

use serde_json::Value;
use uuid::Uuid;

use flowkit_core::models::{Run, RunStatus};
use flowkit_core::validation::{validate_input, ValidationIssue};
use flowkit_core::AppError;
use flowkit_db::{PipelineRepository, QueueJobRepository, RunRepository};

#[derive(Clone)]
pub struct RunService {
    runs: RunRepository,
    pipelines: PipelineRepository,
    jobs: QueueJobRepository,
}

impl RunService {
    pub fn new(
        runs: RunRepository,
        pipelines: PipelineRepository,
        jobs: QueueJobRepository,
    ) -> Self {
        Self {
            runs,
            pipelines,
            jobs,
        }
    }

    /// Create a run against the latest published version and enqueue it.
    ///
    /// Validation failures surface synchronously and nothing is enqueued.
    /// The persisted run carries the normalized input (defaults applied), not
    /// the raw payload.
    #[tracing::instrument(skip(self, raw_input))]
    pub async fn create_run(
        &self,
        user_id: Uuid,
        pipeline_id: Uuid,
        raw_input: Value,
    ) -> Result<Run, AppError> {
        let pipeline = self
            .pipelines
            .get(pipeline_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| AppError::NotFound("Pipeline not found or access denied".into()))?;

        let version = self
            .pipelines
            .latest_version(pipeline.id)
            .await?
            .ok_or_else(|| {
                AppError::BadRequest("Pipeline has no published version".into())
            })?;

        let raw = match raw_input {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            _ => {
                return Err(AppError::InvalidInput(vec![ValidationIssue {
                    field: "input".into(),
                    message: "input payload must be an object".into(),
                }]))
            }
        };

        let schema = version.parsed_input_schema()?;
        let outcome = validate_input(&schema, &raw);
        if !outcome.valid {
            return Err(AppError::InvalidInput(outcome.issues));
        }

        let run = self
            .runs
            .create_queued(
                pipeline.id,
                version.version,
                user_id,
                Value::Object(outcome.data),
            )
            .await?;
        self.jobs.enqueue(run.id).await?;

        Ok(run)
    }

    /// Re-submit an existing queued run to the queue — the recovery path when
    /// the original enqueue failed after the run row was created.
    #[tracing::instrument(skip(self))]
    pub async fn enqueue_run(&self, run_id: Uuid) -> Result<(), AppError> {
        let run = self
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Run not found".into()))?;
        if run.status != RunStatus::Queued {
            return Err(AppError::BadRequest(format!(
                "Run is {}, only queued runs can be enqueued",
                run.status
            )));
        }
        self.jobs.enqueue(run_id).await?;
        Ok(())
    }

    pub async fn get_run(&self, user_id: Uuid, run_id: Uuid) -> Result<Run, AppError> {
        self.runs
            .get(run_id)
            .await?
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| AppError::NotFound("Run not found or access denied".into()))
    }

    pub async fn list_runs(
        &self,
        user_id: Uuid,
        pipeline_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Run>, AppError> {
        self.pipelines
            .get(pipeline_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| AppError::NotFound("Pipeline not found or access denied".into()))?;
        Ok(self.runs.list_by_pipeline(pipeline_id, limit, offset).await?)
    }

    /// Cancel a queued or running run. Cancellation is cooperative: a running
    /// run stops at its next step boundary. Idempotent for already-canceled
    /// runs.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_run(&self, user_id: Uuid, run_id: Uuid) -> Result<Run, AppError> {
        let run = self.get_run(user_id, run_id).await?;
        match run.status {
            RunStatus::Canceled => Ok(run),
            RunStatus::Queued | RunStatus::Running => {
                match self.runs.cancel(run_id).await? {
                    Some(run) => Ok(run),
                    // The run reached a terminal status between read and
                    // cancel; report what it became.
                    None => self.get_run(user_id, run_id).await,
                }
            }
            status => Err(AppError::BadRequest(format!(
                "Run already {status}, cannot cancel"
            ))),
        }
    }
}
