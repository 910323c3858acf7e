//! Routing Service
//!
//! Decides which workers may run a task. Eligibility comes from the worker's
//! include/exclude scopes; whitelisting comes from cached connectivity check results.

use chrono::Utc;
use convoy_core::domain::task::{ConnectionResult, Task};
use convoy_core::domain::worker::{Scope, Worker, WorkerStatus};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigurationError, RepositoryResult, RoutingError};
use crate::repository::{ConnectionResultRepository, WorkerRepository};

/// Returns true if `worker` may run `task` according to its scopes
///
/// No include scopes means every task is eligible; otherwise at least one
/// include scope must match. Any matching exclude scope rejects the task.
pub fn can_assign_worker(worker: &Worker, task: &Task) -> Result<bool, ConfigurationError> {
    let mut included = worker.include_scopes.is_empty();
    for scope in &worker.include_scopes {
        if scope_matches(scope, task)? {
            included = true;
            break;
        }
    }

    if !included {
        return Ok(false);
    }

    for scope in &worker.exclude_scopes {
        if scope_matches(scope, task)? {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Matches one scope against a task
///
/// A constrained dimension requires the task to carry a value for it.
pub fn scope_matches(scope: &Scope, task: &Task) -> Result<bool, ConfigurationError> {
    if !scope.is_valid() {
        return Err(ConfigurationError::EmptyScope {
            id: scope.id.clone(),
            name: scope.name.clone(),
        });
    }

    if !scope.environment_types.is_empty()
        && !task
            .env_type
            .is_some_and(|t| scope.environment_types.contains(&t))
    {
        return Ok(false);
    }

    if !scope.task_groups.is_empty()
        && !task
            .task_group
            .is_some_and(|g| scope.task_groups.contains(&g))
    {
        return Ok(false);
    }

    if !in_dimension(&scope.applications, task.app_id.as_deref()) {
        return Ok(false);
    }

    if !in_dimension(&scope.environments, task.env_id.as_deref()) {
        return Ok(false);
    }

    Ok(in_dimension(
        &scope.infrastructure_mappings,
        task.infrastructure_mapping_id.as_deref(),
    ))
}

fn in_dimension(values: &[String], value: Option<&str>) -> bool {
    if values.is_empty() {
        return true;
    }

    match value {
        Some(v) if !v.trim().is_empty() => values.iter().any(|candidate| candidate == v),
        _ => false,
    }
}

/// Task routing over the worker registry and the connection-result cache
#[derive(Clone)]
pub struct RoutingEngine {
    workers: Arc<dyn WorkerRepository>,
    connection_results: Arc<dyn ConnectionResultRepository>,
    heartbeat_timeout: chrono::Duration,
    whitelist_ttl: chrono::Duration,
}

impl RoutingEngine {
    pub fn new(
        workers: Arc<dyn WorkerRepository>,
        connection_results: Arc<dyn ConnectionResultRepository>,
        heartbeat_timeout: Duration,
        whitelist_ttl: Duration,
    ) -> Self {
        Self {
            workers,
            connection_results,
            heartbeat_timeout: chrono::Duration::from_std(heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(315)),
            whitelist_ttl: chrono::Duration::from_std(whitelist_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(6)),
        }
    }

    /// A cached connection result whitelists only while it is validated and younger than the TTL
    fn is_trusted(&self, result: &ConnectionResult) -> bool {
        result.validated && result.last_updated_at >= Utc::now() - self.whitelist_ttl
    }

    /// Returns true if the worker exists and its scopes accept the task
    pub async fn can_assign(
        &self,
        account_id: &str,
        worker_id: &str,
        task: &Task,
    ) -> Result<bool, RoutingError> {
        let Some(worker) = self.workers.find_by_id(account_id, worker_id).await? else {
            tracing::debug!("Worker {} not found in account {}", worker_id, account_id);
            return Ok(false);
        };

        Ok(can_assign_worker(&worker, task)?)
    }

    /// Returns true on the first task criterion with a validated cached result
    ///
    /// Results older than the whitelist TTL are ignored. Lookup failures are
    /// logged and count as "not whitelisted".
    pub async fn is_whitelisted(&self, task: &Task, worker_id: &str) -> bool {
        for criteria in task.criteria.iter().filter(|c| !c.trim().is_empty()) {
            match self
                .connection_results
                .find(&task.account_id, worker_id, criteria)
                .await
            {
                Ok(Some(result)) if self.is_trusted(&result) => return true,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        "Whitelist lookup failed for worker {} in account {} (task {}): {}",
                        worker_id,
                        task.account_id,
                        task.id,
                        e
                    );
                    return false;
                }
            }
        }

        false
    }

    /// Caches connectivity check results, overwriting any earlier result for the same key
    ///
    /// Results with a blank criterion are ignored. Write failures are logged.
    pub async fn save_connection_results(&self, results: Vec<ConnectionResult>) {
        for mut result in results
            .into_iter()
            .filter(|r| !r.criteria.trim().is_empty())
        {
            if let Err(e) = self.upsert_connection_result(&mut result).await {
                if e.is_duplicate_key() {
                    tracing::debug!(
                        "Connection result for worker {} criteria {} written concurrently",
                        result.worker_id,
                        result.criteria
                    );
                } else {
                    tracing::error!(
                        "Failed to save connection result for worker {} in account {}: {}",
                        result.worker_id,
                        result.account_id,
                        e
                    );
                }
            }
        }
    }

    async fn upsert_connection_result(&self, result: &mut ConnectionResult) -> RepositoryResult<()> {
        if let Some(existing) = self
            .connection_results
            .find(&result.account_id, &result.worker_id, &result.criteria)
            .await?
        {
            result.id = existing.id;
        }
        self.connection_results.upsert(result).await
    }

    /// Drops every cached connectivity check result of a worker
    pub async fn clear_connection_results(
        &self,
        account_id: &str,
        worker_id: &str,
    ) -> RepositoryResult<u64> {
        let deleted = self
            .connection_results
            .delete_by_worker(account_id, worker_id)
            .await?;
        tracing::info!(
            "Cleared {} connection results of worker {} in account {}",
            deleted,
            worker_id,
            account_id
        );
        Ok(deleted)
    }

    /// Enabled workers whose last heartbeat is within the heartbeat timeout
    pub async fn active_workers(&self, account_id: &str) -> RepositoryResult<Vec<Worker>> {
        let cutoff = Utc::now() - self.heartbeat_timeout;
        Ok(self
            .workers
            .list_by_account(account_id)
            .await?
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Enabled && w.last_heartbeat_at > cutoff)
            .collect())
    }

    /// Active workers whose scopes accept the task
    pub async fn eligible_workers(&self, task: &Task) -> Result<Vec<Worker>, RoutingError> {
        let mut eligible = Vec::new();
        for worker in self.active_workers(&task.account_id).await? {
            if can_assign_worker(&worker, task)? {
                eligible.push(worker);
            }
        }
        Ok(eligible)
    }

    /// Eligible workers with a trusted result for every task criterion
    pub async fn connected_whitelisted_workers(
        &self,
        task: &Task,
    ) -> Result<Vec<Worker>, RoutingError> {
        let criteria: Vec<&String> = task
            .criteria
            .iter()
            .filter(|c| !c.trim().is_empty())
            .collect();

        let mut connected = Vec::new();
        'workers: for worker in self.eligible_workers(task).await? {
            for c in &criteria {
                let validated = self
                    .connection_results
                    .find(&task.account_id, &worker.id, c)
                    .await?
                    .is_some_and(|r| self.is_trusted(&r));
                if !validated {
                    continue 'workers;
                }
            }
            connected.push(worker);
        }
        Ok(connected)
    }

    /// Picks the worker that should get the first delivery attempt
    ///
    /// Connected whitelisted workers win over merely eligible ones; ties go
    /// to the most recent heartbeat.
    pub async fn pick_first_attempt_worker(
        &self,
        task: &Task,
    ) -> Result<Option<String>, RoutingError> {
        let connected = self.connected_whitelisted_workers(task).await?;
        let candidates = if connected.is_empty() {
            self.eligible_workers(task).await?
        } else {
            connected
        };

        let picked = candidates
            .into_iter()
            .max_by_key(|w| w.last_heartbeat_at)
            .map(|w| w.id);

        match &picked {
            Some(worker_id) => {
                tracing::debug!("Picked worker {} for task {}", worker_id, task.id)
            }
            None => tracing::info!(
                "No worker can take task {} in account {}",
                task.id,
                task.account_id
            ),
        }
        Ok(picked)
    }

    /// Explains why a task has no worker to run on
    pub async fn assignment_failure_message(&self, task: &Task) -> Result<String, RoutingError> {
        let active = self.active_workers(&task.account_id).await?;
        if active.is_empty() {
            return Ok(format!(
                "No active workers are available in account {}",
                task.account_id
            ));
        }

        let mut eligible = Vec::new();
        for worker in &active {
            if can_assign_worker(worker, task)? {
                eligible.push(worker);
            }
        }

        if eligible.is_empty() {
            let hosts: Vec<&str> = active.iter().map(|w| w.host_name.as_str()).collect();
            return Ok(format!(
                "None of the active workers [{}] are eligible to run {} tasks",
                hosts.join(", "),
                task.task_type
            ));
        }

        let hosts: Vec<&str> = eligible.iter().map(|w| w.host_name.as_str()).collect();
        Ok(format!(
            "Eligible workers [{}] have no validated connectivity for [{}]",
            hosts.join(", "),
            task.criteria.join(", ")
        ))
    }
}
