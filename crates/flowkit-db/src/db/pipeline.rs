use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use flowkit_core::models::{Pipeline, PipelineVersion};

#[derive(Clone)]
pub struct PipelineRepository {
    pool: PgPool,
}

impl PipelineRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pipeline container (no versions yet).
    #[tracing::instrument(skip(self))]
    pub async fn create(
        &self,
        user_id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> Result<Pipeline> {
        let pipeline: Pipeline = sqlx::query_as::<Postgres, Pipeline>(
            r#"
            INSERT INTO pipelines (user_id, name, description)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, name, description, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert pipeline")?;

        tracing::info!(pipeline_id = %pipeline.id, user_id = %user_id, "Pipeline created");
        Ok(pipeline)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, pipeline_id: Uuid) -> Result<Option<Pipeline>> {
        let pipeline: Option<Pipeline> = sqlx::query_as::<Postgres, Pipeline>(
            r#"
            SELECT id, user_id, name, description, created_at, updated_at
            FROM pipelines
            WHERE id = $1
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch pipeline")?;

        Ok(pipeline)
    }

    /// Publish a new immutable version. The version number is allocated from
    /// the current maximum; the unique constraint on `(pipeline_id, version)`
    /// rejects the loser of a concurrent publish.
    #[tracing::instrument(skip(self, input_schema, steps))]
    pub async fn publish_version(
        &self,
        pipeline_id: Uuid,
        input_schema: serde_json::Value,
        steps: serde_json::Value,
    ) -> Result<PipelineVersion> {
        let version: PipelineVersion = sqlx::query_as::<Postgres, PipelineVersion>(
            r#"
            INSERT INTO pipeline_versions (pipeline_id, version, input_schema, steps)
            SELECT $1, COALESCE(MAX(version), 0) + 1, $2, $3
            FROM pipeline_versions
            WHERE pipeline_id = $1
            RETURNING id, pipeline_id, version, input_schema, steps, published_at
            "#,
        )
        .bind(pipeline_id)
        .bind(input_schema)
        .bind(steps)
        .fetch_one(&self.pool)
        .await
        .context("Failed to publish pipeline version")?;

        tracing::info!(
            pipeline_id = %pipeline_id,
            version = version.version,
            "Pipeline version published"
        );
        Ok(version)
    }

    /// Latest published version, the one schedules and new runs bind to.
    #[tracing::instrument(skip(self))]
    pub async fn latest_version(&self, pipeline_id: Uuid) -> Result<Option<PipelineVersion>> {
        let version: Option<PipelineVersion> = sqlx::query_as::<Postgres, PipelineVersion>(
            r#"
            SELECT id, pipeline_id, version, input_schema, steps, published_at
            FROM pipeline_versions
            WHERE pipeline_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest pipeline version")?;

        Ok(version)
    }

    /// Point lookup of a specific version, used by the executor to pin a run
    /// to the version it was created against.
    #[tracing::instrument(skip(self))]
    pub async fn get_version(
        &self,
        pipeline_id: Uuid,
        version: i32,
    ) -> Result<Option<PipelineVersion>> {
        let row: Option<PipelineVersion> = sqlx::query_as::<Postgres, PipelineVersion>(
            r#"
            SELECT id, pipeline_id, version, input_schema, steps, published_at
            FROM pipeline_versions
            WHERE pipeline_id = $1 AND version = $2
            "#,
        )
        .bind(pipeline_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch pipeline version")?;

        Ok(row)
    }
}
