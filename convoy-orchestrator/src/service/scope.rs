//! Scope Service
//!
//! Workers embed copies of the scopes assigned to them. Editing or deleting
//! a scope rewrites every worker that holds a copy, under an account-wide
//! lock so two edits cannot interleave their fan-out.

use convoy_core::domain::worker::{Scope, Worker};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigurationError, ScopeUpdateError};
use crate::lock::{DistributedLock, acquire_lock};
use crate::repository::WorkerRepository;
use crate::service::routing::RoutingEngine;

const SCOPE_LOCK_WAIT: Duration = Duration::from_secs(10);
const SCOPE_LOCK_HOLD: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ScopeService {
    workers: Arc<dyn WorkerRepository>,
    lock: Arc<dyn DistributedLock>,
    routing: RoutingEngine,
}

impl ScopeService {
    pub fn new(
        workers: Arc<dyn WorkerRepository>,
        lock: Arc<dyn DistributedLock>,
        routing: RoutingEngine,
    ) -> Self {
        Self {
            workers,
            lock,
            routing,
        }
    }

    /// Replaces every embedded copy of `scope` in the account's workers
    ///
    /// Returns the number of workers rewritten.
    pub async fn update_scope(
        &self,
        account_id: &str,
        scope: &Scope,
    ) -> Result<usize, ScopeUpdateError> {
        if !scope.is_valid() {
            return Err(ConfigurationError::EmptyScope {
                id: scope.id.clone(),
                name: scope.name.clone(),
            }
            .into());
        }

        self.fan_out(account_id, &scope.id, |scopes| {
            scopes
                .iter()
                .map(|s| if s.id == scope.id { scope.clone() } else { s.clone() })
                .collect()
        })
        .await
    }

    /// Drops every embedded copy of a scope from the account's workers
    pub async fn remove_scope(
        &self,
        account_id: &str,
        scope_id: &str,
    ) -> Result<usize, ScopeUpdateError> {
        self.fan_out(account_id, scope_id, |scopes| {
            scopes.iter().filter(|s| s.id != scope_id).cloned().collect()
        })
        .await
    }

    async fn fan_out<F>(
        &self,
        account_id: &str,
        scope_id: &str,
        rebuild: F,
    ) -> Result<usize, ScopeUpdateError>
    where
        F: Fn(&[Scope]) -> Vec<Scope>,
    {
        let resource = format!("scope:{account_id}");
        let Some(guard) =
            acquire_lock(self.lock.clone(), &resource, SCOPE_LOCK_WAIT, SCOPE_LOCK_HOLD).await?
        else {
            return Err(ScopeUpdateError::Contended(account_id.to_string()));
        };

        let result = self.rewrite_workers(account_id, scope_id, rebuild).await;

        if let Err(e) = guard.release().await {
            tracing::warn!("Failed to release scope lock for account {}: {}", account_id, e);
        }

        result
    }

    async fn rewrite_workers<F>(
        &self,
        account_id: &str,
        scope_id: &str,
        rebuild: F,
    ) -> Result<usize, ScopeUpdateError>
    where
        F: Fn(&[Scope]) -> Vec<Scope>,
    {
        let holders: Vec<Worker> = self
            .workers
            .list_by_account(account_id)
            .await?
            .into_iter()
            .filter(|w| w.holds_scope(scope_id))
            .collect();

        let mut updated = 0;
        for worker in holders {
            let include = rebuild(&worker.include_scopes);
            let exclude = rebuild(&worker.exclude_scopes);

            if !self.workers.update_scopes(&worker.id, &include, &exclude).await? {
                tracing::debug!("Worker {} disappeared during scope update", worker.id);
                continue;
            }
            updated += 1;

            // Earlier connectivity checks ran under the old scopes
            if let Err(e) = self
                .routing
                .clear_connection_results(account_id, &worker.id)
                .await
            {
                tracing::error!(
                    "Failed to clear connection results of worker {} in account {}: {}",
                    worker.id,
                    account_id,
                    e
                );
            }
        }

        tracing::info!(
            "Scope {} rewritten on {} workers in account {}",
            scope_id,
            updated,
            account_id
        );
        Ok(updated)
    }
}
