//! Connection Result Repository
//!
//! Handles the cache of connectivity check results used for whitelisting.

use async_trait::async_trait;
use convoy_core::domain::task::ConnectionResult;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{RepositoryError, RepositoryResult};

/// Repository trait for cached connection results
#[async_trait]
pub trait ConnectionResultRepository: Send + Sync {
    /// Finds the result stored for (account, worker, criteria)
    async fn find(
        &self,
        account_id: &str,
        worker_id: &str,
        criteria: &str,
    ) -> RepositoryResult<Option<ConnectionResult>>;

    /// Inserts the result, or overwrites the record with the same id
    ///
    /// Fails with [`RepositoryError::DuplicateKey`] when another record
    /// already holds the (account, worker, criteria) key.
    async fn upsert(&self, result: &ConnectionResult) -> RepositoryResult<()>;

    /// Deletes every result cached for a worker
    async fn delete_by_worker(&self, account_id: &str, worker_id: &str) -> RepositoryResult<u64>;
}

/// PostgreSQL implementation of ConnectionResultRepository
#[derive(Clone)]
pub struct PgConnectionResultRepository {
    pool: PgPool,
}

impl PgConnectionResultRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConnectionResultRepository for PgConnectionResultRepository {
    async fn find(
        &self,
        account_id: &str,
        worker_id: &str,
        criteria: &str,
    ) -> RepositoryResult<Option<ConnectionResult>> {
        let row = sqlx::query_as::<_, ConnectionResultRow>(
            r#"
            SELECT id, account_id, worker_id, criteria, validated, last_updated_at
            FROM connection_results
            WHERE account_id = $1 AND worker_id = $2 AND criteria = $3
            "#,
        )
        .bind(account_id)
        .bind(worker_id)
        .bind(criteria)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn upsert(&self, result: &ConnectionResult) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO connection_results (id, account_id, worker_id, criteria, validated, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                validated = EXCLUDED.validated,
                last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(result.id)
        .bind(&result.account_id)
        .bind(&result.worker_id)
        .bind(&result.criteria)
        .bind(result.validated)
        .bind(result.last_updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::DuplicateKey(format!(
                    "{}/{}/{}",
                    result.account_id, result.worker_id, result.criteria
                ))
            }
            other => RepositoryError::Database(other),
        })?;

        Ok(())
    }

    async fn delete_by_worker(&self, account_id: &str, worker_id: &str) -> RepositoryResult<u64> {
        let result =
            sqlx::query("DELETE FROM connection_results WHERE account_id = $1 AND worker_id = $2")
                .bind(account_id)
                .bind(worker_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ConnectionResultRow {
    id: Uuid,
    account_id: String,
    worker_id: String,
    criteria: String,
    validated: bool,
    last_updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<ConnectionResultRow> for ConnectionResult {
    fn from(row: ConnectionResultRow) -> Self {
        ConnectionResult {
            id: row.id,
            account_id: row.account_id,
            worker_id: row.worker_id,
            criteria: row.criteria,
            validated: row.validated,
            last_updated_at: row.last_updated_at,
        }
    }
}
