//! Alert Repository
//!
//! Handles all database operations related to alerts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::domain::alert::{
    Alert, AlertCategory, AlertSeverity, AlertStatus, AlertType, GLOBAL_APP_ID,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{RepositoryError, RepositoryResult};

/// Narrows an open-alert lookup to an account, an application, or both
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertFilter {
    pub account_id: Option<String>,
    pub app_id: Option<String>,
}

impl AlertFilter {
    /// Filter used for deduplication: global alerts are scoped to the
    /// account, application alerts to the application alone.
    pub fn for_alert(account_id: &str, app_id: &str) -> Self {
        if app_id == GLOBAL_APP_ID {
            Self {
                account_id: Some(account_id.to_string()),
                app_id: Some(GLOBAL_APP_ID.to_string()),
            }
        } else {
            Self::app(app_id)
        }
    }

    pub fn account(account_id: &str) -> Self {
        Self {
            account_id: Some(account_id.to_string()),
            app_id: None,
        }
    }

    pub fn app(app_id: &str) -> Self {
        Self {
            account_id: None,
            app_id: Some(app_id.to_string()),
        }
    }

    pub fn accepts(&self, alert: &Alert) -> bool {
        self.account_id
            .as_deref()
            .is_none_or(|account| alert.account_id == account)
            && self.app_id.as_deref().is_none_or(|app| alert.app_id == app)
    }
}

/// Repository trait for alert persistence
#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Lists open alerts of one type accepted by the filter
    async fn find_open(
        &self,
        filter: &AlertFilter,
        alert_type: AlertType,
    ) -> RepositoryResult<Vec<Alert>>;

    /// Inserts a new alert
    async fn insert(&self, alert: &Alert) -> RepositoryResult<()>;

    /// Closes an open alert
    ///
    /// Returns false if the alert does not exist or is already closed.
    async fn close(&self, alert_id: Uuid, closed_at: DateTime<Utc>) -> RepositoryResult<bool>;

    /// Ids of closed alerts whose close time is before the cutoff, oldest first
    async fn find_closed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<Uuid>>;

    /// Deletes alerts by id
    async fn delete_by_ids(&self, ids: &[Uuid]) -> RepositoryResult<u64>;
}

/// PostgreSQL implementation of AlertRepository
#[derive(Clone)]
pub struct PgAlertRepository {
    pool: PgPool,
}

impl PgAlertRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertRepository for PgAlertRepository {
    async fn find_open(
        &self,
        filter: &AlertFilter,
        alert_type: AlertType,
    ) -> RepositoryResult<Vec<Alert>> {
        let rows = sqlx::query_as::<_, AlertRow>(
            r#"
            SELECT id, account_id, app_id, alert_type, status,
                   title, payload, created_at, closed_at
            FROM alerts
            WHERE status = $1
              AND alert_type = $2
              AND ($3::text IS NULL OR account_id = $3)
              AND ($4::text IS NULL OR app_id = $4)
            ORDER BY created_at ASC
            "#,
        )
        .bind(AlertStatus::Open.as_str())
        .bind(alert_type.as_str())
        .bind(filter.account_id.as_deref())
        .bind(filter.app_id.as_deref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Alert::try_from).collect()
    }

    async fn insert(&self, alert: &Alert) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (id, account_id, app_id, alert_type, status, category,
                                severity, title, payload, created_at, closed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(alert.id)
        .bind(&alert.account_id)
        .bind(&alert.app_id)
        .bind(alert.alert_type.as_str())
        .bind(alert.status.as_str())
        .bind(category_str(alert.category))
        .bind(severity_str(alert.severity))
        .bind(&alert.title)
        .bind(serde_json::to_value(&alert.payload)?)
        .bind(alert.created_at)
        .bind(alert.closed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn close(&self, alert_id: Uuid, closed_at: DateTime<Utc>) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE alerts
            SET status = $1, closed_at = $2
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(AlertStatus::Closed.as_str())
        .bind(closed_at)
        .bind(alert_id)
        .bind(AlertStatus::Open.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_closed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM alerts
            WHERE status = $1 AND closed_at < $2
            ORDER BY closed_at ASC
            LIMIT $3
            "#,
        )
        .bind(AlertStatus::Closed.as_str())
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn delete_by_ids(&self, ids: &[Uuid]) -> RepositoryResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM alerts WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn category_str(category: AlertCategory) -> &'static str {
    match category {
        AlertCategory::Setup => "Setup",
        AlertCategory::Approval => "Approval",
        AlertCategory::ManualIntervention => "ManualIntervention",
    }
}

fn severity_str(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Warning => "Warning",
        AlertSeverity::Error => "Error",
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: Uuid,
    account_id: String,
    app_id: String,
    alert_type: String,
    status: String,
    title: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = RepositoryError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        let alert_type = AlertType::parse(&row.alert_type).ok_or_else(|| {
            RepositoryError::corrupt("alert", row.id.to_string(), "unknown alert type")
        })?;

        let status = match row.status.as_str() {
            "Open" => AlertStatus::Open,
            "Closed" => AlertStatus::Closed,
            other => {
                return Err(RepositoryError::corrupt(
                    "alert",
                    row.id.to_string(),
                    format!("unknown status {other}"),
                ));
            }
        };

        // Category and severity are fixed by the type
        Ok(Alert {
            id: row.id,
            account_id: row.account_id,
            app_id: row.app_id,
            alert_type,
            status,
            category: alert_type.category(),
            severity: alert_type.severity(),
            title: row.title,
            payload: serde_json::from_value(row.payload)?,
            created_at: row.created_at,
            closed_at: row.closed_at,
        })
    }
}
