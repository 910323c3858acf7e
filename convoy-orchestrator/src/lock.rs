//! Distributed lock
//!
//! Cross-process mutual exclusion keyed by resource name. Every lock carries
//! a hold timeout so a crashed holder cannot block a resource forever, and a
//! holder id so only the holder can release it.
//!
//! Callers use [`acquire_lock`], which returns a [`LockGuard`]. The guard
//! releases on `release().await` or, on any other exit path, when dropped.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::LockError;

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Proof of ownership of a resource lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub resource: String,
    pub holder_id: Uuid,
}

/// Lock backend contract
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Takes the lock if it is free or its previous hold has expired
    ///
    /// Returns `None` when another holder owns it.
    async fn try_acquire(
        &self,
        resource: &str,
        hold: Duration,
    ) -> Result<Option<LockHandle>, LockError>;

    /// Releases the lock if `handle` still owns it
    async fn release(&self, handle: &LockHandle) -> Result<(), LockError>;
}

/// Acquires `resource`, retrying with backoff until `wait` elapses
///
/// A zero `wait` makes exactly one attempt. Returns `Ok(None)` on contention.
pub async fn acquire_lock(
    lock: Arc<dyn DistributedLock>,
    resource: &str,
    wait: Duration,
    hold: Duration,
) -> Result<Option<LockGuard>, LockError> {
    let deadline = Instant::now() + wait;
    let mut backoff = BACKOFF_BASE;

    loop {
        if let Some(handle) = lock.try_acquire(resource, hold).await? {
            tracing::debug!("Lock {} acquired by {}", resource, handle.holder_id);
            return Ok(Some(LockGuard {
                lock,
                handle,
                released: false,
            }));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }

        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = backoff.saturating_mul(2).min(BACKOFF_MAX);
    }
}

/// Scoped ownership of a lock
pub struct LockGuard {
    lock: Arc<dyn DistributedLock>,
    handle: LockHandle,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.handle.resource
    }

    /// Releases the lock now
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.lock.release(&self.handle).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // Without a runtime the hold timeout frees the lock
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let lock = self.lock.clone();
        let handle = self.handle.clone();
        runtime.spawn(async move {
            if let Err(e) = lock.release(&handle).await {
                tracing::warn!("Failed to release dropped lock {}: {}", handle.resource, e);
            }
        });
    }
}

/// PostgreSQL lock backend
///
/// One row per resource. A new holder replaces the row only after the
/// previous hold expired.
#[derive(Clone)]
pub struct PgLock {
    pool: PgPool,
}

impl PgLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for PgLock {
    async fn try_acquire(
        &self,
        resource: &str,
        hold: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let holder_id = Uuid::new_v4();
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(hold).unwrap_or_else(|_| chrono::Duration::seconds(60));

        let acquired = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO distributed_locks (resource, holder_id, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (resource) DO UPDATE SET
                holder_id = EXCLUDED.holder_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE distributed_locks.expires_at < EXCLUDED.acquired_at
            RETURNING holder_id
            "#,
        )
        .bind(resource)
        .bind(holder_id)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.map(|holder_id| LockHandle {
            resource: resource.to_string(),
            holder_id,
        }))
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        sqlx::query("DELETE FROM distributed_locks WHERE resource = $1 AND holder_id = $2")
            .bind(&handle.resource)
            .bind(handle.holder_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Process-local lock backend
#[derive(Clone, Default)]
pub struct InMemoryLock {
    held: Arc<Mutex<HashMap<String, (Uuid, Instant)>>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, resource: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.get(resource)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(
        &self,
        resource: &str,
        hold: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if let Some((_, expires_at)) = held.get(resource) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let holder_id = Uuid::new_v4();
        held.insert(resource.to_string(), (holder_id, now + hold));
        Ok(Some(LockHandle {
            resource: resource.to_string(),
            holder_id,
        }))
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held
            .get(&handle.resource)
            .is_some_and(|(holder_id, _)| *holder_id == handle.holder_id)
        {
            held.remove(&handle.resource);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_is_contended() {
        let lock: Arc<dyn DistributedLock> = Arc::new(InMemoryLock::new());
        let hold = Duration::from_secs(60);

        let guard = acquire_lock(lock.clone(), "wf1", Duration::ZERO, hold)
            .await
            .unwrap();
        assert!(guard.is_some());

        let second = acquire_lock(lock.clone(), "wf1", Duration::ZERO, hold)
            .await
            .unwrap();
        assert!(second.is_none());

        guard.unwrap().release().await.unwrap();
        let third = acquire_lock(lock, "wf1", Duration::ZERO, hold).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_expired_hold_can_be_taken_over() {
        let lock = InMemoryLock::new();
        let first = lock
            .try_acquire("wf1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = lock
            .try_acquire("wf1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        // The stale holder cannot free the new hold
        lock.release(&first).await.unwrap();
        assert!(lock.is_held("wf1"));

        lock.release(&second).await.unwrap();
        assert!(!lock.is_held("wf1"));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let backend = InMemoryLock::new();
        let lock: Arc<dyn DistributedLock> = Arc::new(backend.clone());

        {
            let _guard = acquire_lock(lock, "scope:acct", Duration::ZERO, Duration::from_secs(60))
                .await
                .unwrap()
                .unwrap();
            assert!(backend.is_held("scope:acct"));
        }

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!backend.is_held("scope:acct"));
    }

    #[tokio::test]
    async fn test_wait_retries_until_free() {
        let backend = InMemoryLock::new();
        let lock: Arc<dyn DistributedLock> = Arc::new(backend.clone());
        backend
            .try_acquire("wf1", Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();

        let guard = acquire_lock(lock, "wf1", Duration::from_secs(2), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(guard.is_some());
    }
}
