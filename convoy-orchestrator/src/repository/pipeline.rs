//! Pipeline Repository
//!
//! Handles all database operations related to pipelines, their executions
//! and the per-state ETA tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::domain::execution::{ExecutionStatus, FINAL_STATUSES};
use convoy_core::domain::pipeline::{Pipeline, PipelineExecution};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{RepositoryError, RepositoryResult};

/// Repository trait for pipelines and pipeline executions
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Finds a pipeline definition by id
    async fn find_pipeline(&self, app_id: &str, pipeline_id: &str)
    -> RepositoryResult<Option<Pipeline>>;

    /// Finds the projection of a workflow execution
    async fn find_execution(
        &self,
        app_id: &str,
        workflow_execution_id: Uuid,
    ) -> RepositoryResult<Option<PipelineExecution>>;

    /// Inserts a new projection at version 0
    async fn insert_execution(&self, execution: &PipelineExecution) -> RepositoryResult<()>;

    /// Saves a projection if its stored version still equals `execution.version`
    ///
    /// Returns the new version. Fails with
    /// [`RepositoryError::ConcurrentModification`] when another writer saved first.
    async fn save_execution(&self, execution: &PipelineExecution) -> RepositoryResult<i64>;

    /// Loads the most recent successful executions of a pipeline, newest end time first
    async fn find_recent_successful(
        &self,
        app_id: &str,
        pipeline_id: &str,
        limit: usize,
    ) -> RepositoryResult<Vec<PipelineExecution>>;

    /// Replaces the ETA table of a pipeline
    ///
    /// Returns false if the pipeline does not exist.
    async fn update_state_eta_map(
        &self,
        app_id: &str,
        pipeline_id: &str,
        state_eta_map: &HashMap<String, i64>,
    ) -> RepositoryResult<bool>;

    /// Lists projections not yet in a final status, oldest start first
    async fn find_unfinished(&self, limit: usize) -> RepositoryResult<Vec<PipelineExecution>>;
}

/// PostgreSQL implementation of PipelineRepository
#[derive(Clone)]
pub struct PgPipelineRepository {
    pool: PgPool,
}

impl PgPipelineRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineRepository for PgPipelineRepository {
    async fn find_pipeline(
        &self,
        app_id: &str,
        pipeline_id: &str,
    ) -> RepositoryResult<Option<Pipeline>> {
        let row = sqlx::query_as::<_, PipelineRow>(
            "SELECT id, app_id, name, state_eta_map FROM pipelines WHERE app_id = $1 AND id = $2",
        )
        .bind(app_id)
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Pipeline::try_from).transpose()
    }

    async fn find_execution(
        &self,
        app_id: &str,
        workflow_execution_id: Uuid,
    ) -> RepositoryResult<Option<PipelineExecution>> {
        let row = sqlx::query_as::<_, PipelineExecutionRow>(
            r#"
            SELECT workflow_execution_id, app_id, pipeline_id, pipeline_name, status,
                   started_at, ended_at, stage_executions, state_eta_map, version
            FROM pipeline_executions
            WHERE app_id = $1 AND workflow_execution_id = $2
            "#,
        )
        .bind(app_id)
        .bind(workflow_execution_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PipelineExecution::try_from).transpose()
    }

    async fn insert_execution(&self, execution: &PipelineExecution) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_executions (
                workflow_execution_id, app_id, pipeline_id, pipeline_name, status,
                started_at, ended_at, stage_executions, state_eta_map, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0)
            "#,
        )
        .bind(execution.workflow_execution_id)
        .bind(&execution.app_id)
        .bind(&execution.pipeline_id)
        .bind(&execution.pipeline_name)
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .bind(execution.ended_at)
        .bind(serde_json::to_value(&execution.stage_executions)?)
        .bind(serde_json::to_value(&execution.state_eta_map)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_execution(&self, execution: &PipelineExecution) -> RepositoryResult<i64> {
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE pipeline_executions
            SET status = $1,
                started_at = $2,
                ended_at = $3,
                stage_executions = $4,
                state_eta_map = $5,
                version = version + 1
            WHERE app_id = $6 AND workflow_execution_id = $7 AND version = $8
            RETURNING version
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .bind(execution.ended_at)
        .bind(serde_json::to_value(&execution.stage_executions)?)
        .bind(serde_json::to_value(&execution.state_eta_map)?)
        .bind(&execution.app_id)
        .bind(execution.workflow_execution_id)
        .bind(execution.version)
        .fetch_optional(&self.pool)
        .await?;

        version.ok_or_else(|| RepositoryError::ConcurrentModification {
            entity: "pipeline execution",
            id: execution.workflow_execution_id.to_string(),
        })
    }

    async fn find_recent_successful(
        &self,
        app_id: &str,
        pipeline_id: &str,
        limit: usize,
    ) -> RepositoryResult<Vec<PipelineExecution>> {
        let rows = sqlx::query_as::<_, PipelineExecutionRow>(
            r#"
            SELECT workflow_execution_id, app_id, pipeline_id, pipeline_name, status,
                   started_at, ended_at, stage_executions, state_eta_map, version
            FROM pipeline_executions
            WHERE app_id = $1 AND pipeline_id = $2 AND status = $3
            ORDER BY ended_at DESC NULLS LAST
            LIMIT $4
            "#,
        )
        .bind(app_id)
        .bind(pipeline_id)
        .bind(ExecutionStatus::Success.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PipelineExecution::try_from).collect()
    }

    async fn update_state_eta_map(
        &self,
        app_id: &str,
        pipeline_id: &str,
        state_eta_map: &HashMap<String, i64>,
    ) -> RepositoryResult<bool> {
        let result =
            sqlx::query("UPDATE pipelines SET state_eta_map = $1 WHERE app_id = $2 AND id = $3")
                .bind(serde_json::to_value(state_eta_map)?)
                .bind(app_id)
                .bind(pipeline_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_unfinished(&self, limit: usize) -> RepositoryResult<Vec<PipelineExecution>> {
        let finals: Vec<String> = FINAL_STATUSES
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let rows = sqlx::query_as::<_, PipelineExecutionRow>(
            r#"
            SELECT workflow_execution_id, app_id, pipeline_id, pipeline_name, status,
                   started_at, ended_at, stage_executions, state_eta_map, version
            FROM pipeline_executions
            WHERE status <> ALL($1)
            ORDER BY started_at ASC NULLS FIRST
            LIMIT $2
            "#,
        )
        .bind(finals)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PipelineExecution::try_from).collect()
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: String,
    app_id: String,
    name: String,
    state_eta_map: serde_json::Value,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = RepositoryError;

    fn try_from(row: PipelineRow) -> Result<Self, Self::Error> {
        Ok(Pipeline {
            id: row.id,
            app_id: row.app_id,
            name: row.name,
            state_eta_map: serde_json::from_value(row.state_eta_map)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PipelineExecutionRow {
    workflow_execution_id: Uuid,
    app_id: String,
    pipeline_id: String,
    pipeline_name: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    stage_executions: serde_json::Value,
    state_eta_map: serde_json::Value,
    version: i64,
}

impl TryFrom<PipelineExecutionRow> for PipelineExecution {
    type Error = RepositoryError;

    fn try_from(row: PipelineExecutionRow) -> Result<Self, Self::Error> {
        let status = ExecutionStatus::parse(&row.status).ok_or_else(|| {
            RepositoryError::corrupt(
                "pipeline execution",
                row.workflow_execution_id.to_string(),
                "unknown status",
            )
        })?;

        Ok(PipelineExecution {
            workflow_execution_id: row.workflow_execution_id,
            app_id: row.app_id,
            pipeline_id: row.pipeline_id,
            pipeline_name: row.pipeline_name,
            status,
            started_at: row.started_at,
            ended_at: row.ended_at,
            stage_executions: serde_json::from_value(row.stage_executions)?,
            state_eta_map: serde_json::from_value(row.state_eta_map)?,
            version: row.version,
        })
    }
}
