//! State Execution Repository
//!
//! Read access to the per-state records written by the state-machine interpreter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::domain::execution::{ExecutionStatus, StateExecutionInstance, StateType};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{RepositoryError, RepositoryResult};

/// Repository trait for state execution instances
#[async_trait]
pub trait StateExecutionRepository: Send + Sync {
    /// Lists every state instance recorded for an execution, oldest first
    async fn list_by_execution(
        &self,
        app_id: &str,
        execution_id: Uuid,
    ) -> RepositoryResult<Vec<StateExecutionInstance>>;
}

/// PostgreSQL implementation of StateExecutionRepository
#[derive(Clone)]
pub struct PgStateExecutionRepository {
    pool: PgPool,
}

impl PgStateExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateExecutionRepository for PgStateExecutionRepository {
    async fn list_by_execution(
        &self,
        app_id: &str,
        execution_id: Uuid,
    ) -> RepositoryResult<Vec<StateExecutionInstance>> {
        let rows = sqlx::query_as::<_, StateExecutionRow>(
            r#"
            SELECT id, app_id, execution_id, state_name, state_type, status,
                   started_at, ended_at, state_execution_map, created_at
            FROM state_execution_instances
            WHERE app_id = $1 AND execution_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(app_id)
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StateExecutionInstance::try_from).collect()
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct StateExecutionRow {
    id: Uuid,
    app_id: String,
    execution_id: Uuid,
    state_name: String,
    state_type: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    state_execution_map: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<StateExecutionRow> for StateExecutionInstance {
    type Error = RepositoryError;

    fn try_from(row: StateExecutionRow) -> Result<Self, Self::Error> {
        let state_type = StateType::parse(&row.state_type).ok_or_else(|| {
            RepositoryError::corrupt(
                "state execution",
                row.id.to_string(),
                format!("unknown state type {}", row.state_type),
            )
        })?;
        let status = ExecutionStatus::parse(&row.status).ok_or_else(|| {
            RepositoryError::corrupt("state execution", row.id.to_string(), "unknown status")
        })?;

        Ok(StateExecutionInstance {
            id: row.id,
            app_id: row.app_id,
            execution_id: row.execution_id,
            state_name: row.state_name,
            state_type,
            status,
            started_at: row.started_at,
            ended_at: row.ended_at,
            state_execution_map: serde_json::from_value(row.state_execution_map)?,
            created_at: row.created_at,
        })
    }
}
