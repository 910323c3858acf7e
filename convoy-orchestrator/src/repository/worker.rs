//! Worker Repository
//!
//! Handles all database operations related to workers and their embedded scopes.

use async_trait::async_trait;
use convoy_core::domain::worker::{Scope, Worker, WorkerStatus};
use sqlx::PgPool;

use crate::error::{RepositoryError, RepositoryResult};

/// Repository trait for worker lookups and scope updates
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// Finds a worker by id within an account
    async fn find_by_id(&self, account_id: &str, worker_id: &str) -> RepositoryResult<Option<Worker>>;

    /// Lists every worker registered for an account
    async fn list_by_account(&self, account_id: &str) -> RepositoryResult<Vec<Worker>>;

    /// Replaces both scope lists of a worker
    ///
    /// Returns false if the worker does not exist.
    async fn update_scopes(
        &self,
        worker_id: &str,
        include_scopes: &[Scope],
        exclude_scopes: &[Scope],
    ) -> RepositoryResult<bool>;
}

/// PostgreSQL implementation of WorkerRepository
#[derive(Clone)]
pub struct PgWorkerRepository {
    pool: PgPool,
}

impl PgWorkerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRepository for PgWorkerRepository {
    async fn find_by_id(&self, account_id: &str, worker_id: &str) -> RepositoryResult<Option<Worker>> {
        let row = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT id, account_id, host_name, registered_at, last_heartbeat_at,
                   status, include_scopes, exclude_scopes
            FROM workers
            WHERE account_id = $1 AND id = $2
            "#,
        )
        .bind(account_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Worker::try_from).transpose()
    }

    async fn list_by_account(&self, account_id: &str) -> RepositoryResult<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT id, account_id, host_name, registered_at, last_heartbeat_at,
                   status, include_scopes, exclude_scopes
            FROM workers
            WHERE account_id = $1
            ORDER BY registered_at ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn update_scopes(
        &self,
        worker_id: &str,
        include_scopes: &[Scope],
        exclude_scopes: &[Scope],
    ) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET include_scopes = $1, exclude_scopes = $2
            WHERE id = $3
            "#,
        )
        .bind(serde_json::to_value(include_scopes)?)
        .bind(serde_json::to_value(exclude_scopes)?)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: String,
    account_id: String,
    host_name: String,
    registered_at: chrono::DateTime<chrono::Utc>,
    last_heartbeat_at: chrono::DateTime<chrono::Utc>,
    status: String,
    include_scopes: serde_json::Value,
    exclude_scopes: serde_json::Value,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = RepositoryError;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        // Unknown statuses keep the worker out of routing
        let status = WorkerStatus::parse(&row.status).unwrap_or(WorkerStatus::Disabled);

        Ok(Worker {
            include_scopes: serde_json::from_value(row.include_scopes)?,
            exclude_scopes: serde_json::from_value(row.exclude_scopes)?,
            id: row.id,
            account_id: row.account_id,
            host_name: row.host_name,
            registered_at: row.registered_at,
            last_heartbeat_at: row.last_heartbeat_at,
            status,
        })
    }
}
