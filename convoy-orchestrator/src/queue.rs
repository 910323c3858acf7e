//! Durable execution event queue
//!
//! At-least-once delivery of [`ExecutionEvent`]s. A polled message becomes
//! invisible for the visibility timeout and is delivered again unless it is
//! acknowledged first.

use async_trait::async_trait;
use chrono::Utc;
use convoy_core::dto::queue::ExecutionEvent;
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::RepositoryResult;

/// A delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: Uuid,
    pub event: ExecutionEvent,
    /// Number of deliveries including this one
    pub attempts: i32,
}

/// Queue contract
#[async_trait]
pub trait ExecutionQueue: Send + Sync {
    /// Enqueues an event
    async fn publish(&self, event: &ExecutionEvent) -> RepositoryResult<Uuid>;

    /// Takes the next visible message, hiding it for `visibility`
    async fn poll(&self, visibility: Duration) -> RepositoryResult<Option<QueueMessage>>;

    /// Removes a delivered message for good
    async fn ack(&self, message_id: Uuid) -> RepositoryResult<()>;
}

/// PostgreSQL queue backed by `FOR UPDATE SKIP LOCKED`
#[derive(Clone)]
pub struct PgExecutionQueue {
    pool: PgPool,
}

impl PgExecutionQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionQueue for PgExecutionQueue {
    async fn publish(&self, event: &ExecutionEvent) -> RepositoryResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO execution_queue (id, app_id, workflow_id, created_at, visible_at, attempts)
            VALUES ($1, $2, $3, $4, $4, 0)
            "#,
        )
        .bind(id)
        .bind(&event.app_id)
        .bind(&event.workflow_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn poll(&self, visibility: Duration) -> RepositoryResult<Option<QueueMessage>> {
        let now = Utc::now();
        let hidden_until = now
            + chrono::Duration::from_std(visibility).unwrap_or_else(|_| chrono::Duration::minutes(5));

        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            UPDATE execution_queue
            SET visible_at = $1, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM execution_queue
                WHERE visible_at <= $2
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, app_id, workflow_id, attempts
            "#,
        )
        .bind(hidden_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn ack(&self, message_id: Uuid) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM execution_queue WHERE id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    app_id: String,
    workflow_id: String,
    attempts: i32,
}

impl From<QueueRow> for QueueMessage {
    fn from(row: QueueRow) -> Self {
        QueueMessage {
            id: row.id,
            event: ExecutionEvent::new(row.app_id, row.workflow_id),
            attempts: row.attempts,
        }
    }
}

struct PendingMessage {
    id: Uuid,
    event: ExecutionEvent,
    attempts: i32,
    visible_at: Instant,
}

/// Process-local queue with the same redelivery semantics
#[derive(Clone, Default)]
pub struct InMemoryExecutionQueue {
    messages: Arc<Mutex<VecDeque<PendingMessage>>>,
}

impl InMemoryExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages not yet acknowledged
    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events not yet acknowledged, in publish order
    pub fn pending_events(&self) -> Vec<ExecutionEvent> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|m| m.event.clone())
            .collect()
    }
}

#[async_trait]
impl ExecutionQueue for InMemoryExecutionQueue {
    async fn publish(&self, event: &ExecutionEvent) -> RepositoryResult<Uuid> {
        let id = Uuid::new_v4();
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        messages.push_back(PendingMessage {
            id,
            event: event.clone(),
            attempts: 0,
            visible_at: Instant::now(),
        });
        Ok(id)
    }

    async fn poll(&self, visibility: Duration) -> RepositoryResult<Option<QueueMessage>> {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        Ok(messages
            .iter_mut()
            .find(|m| m.visible_at <= now)
            .map(|m| {
                m.visible_at = now + visibility;
                m.attempts += 1;
                QueueMessage {
                    id: m.id,
                    event: m.event.clone(),
                    attempts: m.attempts,
                }
            }))
    }

    async fn ack(&self, message_id: Uuid) -> RepositoryResult<()> {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        messages.retain(|m| m.id != message_id);
        Ok(())
    }
}
