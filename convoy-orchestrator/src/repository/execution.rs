//! Workflow Execution Repository
//!
//! Handles lookups and guarded status transitions of workflow executions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::domain::execution::{
    ACTIVE_STATUSES, ExecutionStatus, WorkflowExecution, WorkflowType,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{RepositoryError, RepositoryResult};

/// Repository trait for workflow executions
#[async_trait]
pub trait WorkflowExecutionRepository: Send + Sync {
    /// Finds an execution by id within an application
    async fn find_by_id(
        &self,
        app_id: &str,
        execution_id: Uuid,
    ) -> RepositoryResult<Option<WorkflowExecution>>;

    /// Finds an execution of the workflow that is currently active
    async fn find_active(
        &self,
        app_id: &str,
        workflow_id: &str,
    ) -> RepositoryResult<Option<WorkflowExecution>>;

    /// Finds the oldest queued execution of the workflow (FIFO by creation time)
    async fn find_oldest_queued(
        &self,
        app_id: &str,
        workflow_id: &str,
    ) -> RepositoryResult<Option<WorkflowExecution>>;

    /// Moves an execution to `status` only if it is still in one of `expected`
    ///
    /// `RUNNING` stamps the start time, final statuses stamp the end time.
    /// Returns false when the execution has already moved on.
    async fn update_status_if(
        &self,
        app_id: &str,
        execution_id: Uuid,
        expected: &[ExecutionStatus],
        status: ExecutionStatus,
        at: DateTime<Utc>,
    ) -> RepositoryResult<bool>;

    /// Lists every (app, workflow) pair that still has queued executions
    async fn find_workflows_with_queued(&self) -> RepositoryResult<Vec<(String, String)>>;
}

/// PostgreSQL implementation of WorkflowExecutionRepository
#[derive(Clone)]
pub struct PgWorkflowExecutionRepository {
    pool: PgPool,
}

impl PgWorkflowExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_strings(statuses: &[ExecutionStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl WorkflowExecutionRepository for PgWorkflowExecutionRepository {
    async fn find_by_id(
        &self,
        app_id: &str,
        execution_id: Uuid,
    ) -> RepositoryResult<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, WorkflowExecutionRow>(
            r#"
            SELECT id, app_id, workflow_id, workflow_type, name, status,
                   created_at, started_at, ended_at
            FROM workflow_executions
            WHERE app_id = $1 AND id = $2
            "#,
        )
        .bind(app_id)
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn find_active(
        &self,
        app_id: &str,
        workflow_id: &str,
    ) -> RepositoryResult<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, WorkflowExecutionRow>(
            r#"
            SELECT id, app_id, workflow_id, workflow_type, name, status,
                   created_at, started_at, ended_at
            FROM workflow_executions
            WHERE app_id = $1 AND workflow_id = $2 AND status = ANY($3)
            LIMIT 1
            "#,
        )
        .bind(app_id)
        .bind(workflow_id)
        .bind(status_strings(&ACTIVE_STATUSES))
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn find_oldest_queued(
        &self,
        app_id: &str,
        workflow_id: &str,
    ) -> RepositoryResult<Option<WorkflowExecution>> {
        let row = sqlx::query_as::<_, WorkflowExecutionRow>(
            r#"
            SELECT id, app_id, workflow_id, workflow_type, name, status,
                   created_at, started_at, ended_at
            FROM workflow_executions
            WHERE app_id = $1 AND workflow_id = $2 AND status = $3
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(app_id)
        .bind(workflow_id)
        .bind(ExecutionStatus::Queued.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowExecution::try_from).transpose()
    }

    async fn update_status_if(
        &self,
        app_id: &str,
        execution_id: Uuid,
        expected: &[ExecutionStatus],
        status: ExecutionStatus,
        at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let started_at = (status == ExecutionStatus::Running).then_some(at);
        let ended_at = status.is_final().then_some(at);

        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $1,
                started_at = COALESCE($2, started_at),
                ended_at = COALESCE($3, ended_at)
            WHERE app_id = $4 AND id = $5 AND status = ANY($6)
            "#,
        )
        .bind(status.as_str())
        .bind(started_at)
        .bind(ended_at)
        .bind(app_id)
        .bind(execution_id)
        .bind(status_strings(expected))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_workflows_with_queued(&self) -> RepositoryResult<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT DISTINCT app_id, workflow_id
            FROM workflow_executions
            WHERE status = $1
            "#,
        )
        .bind(ExecutionStatus::Queued.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct WorkflowExecutionRow {
    id: Uuid,
    app_id: String,
    workflow_id: String,
    workflow_type: String,
    name: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkflowExecutionRow> for WorkflowExecution {
    type Error = RepositoryError;

    fn try_from(row: WorkflowExecutionRow) -> Result<Self, Self::Error> {
        let status = ExecutionStatus::parse(&row.status).ok_or_else(|| {
            RepositoryError::corrupt("workflow execution", row.id.to_string(), "unknown status")
        })?;
        let workflow_type = WorkflowType::parse(&row.workflow_type).ok_or_else(|| {
            RepositoryError::corrupt(
                "workflow execution",
                row.id.to_string(),
                "unknown workflow type",
            )
        })?;

        Ok(WorkflowExecution {
            id: row.id,
            app_id: row.app_id,
            workflow_id: row.workflow_id,
            workflow_type,
            name: row.name,
            status,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
        })
    }
}
