//! In-memory store
//!
//! Implements every repository trait over mutex-guarded collections.
//! Used by the test suites and by embedders that do not need durability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::domain::alert::{Alert, AlertStatus, AlertType};
use convoy_core::domain::execution::{
    ExecutionStatus, StateExecutionInstance, WorkflowExecution,
};
use convoy_core::domain::pipeline::{Pipeline, PipelineExecution};
use convoy_core::domain::task::ConnectionResult;
use convoy_core::domain::worker::{Scope, Worker};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::error::{RepositoryError, RepositoryResult};
use crate::repository::{
    AlertFilter, AlertRepository, ConnectionResultRepository, PipelineRepository,
    StateExecutionRepository, WorkerRepository, WorkflowExecutionRepository,
};

#[derive(Default)]
struct Tables {
    workers: Vec<Worker>,
    connection_results: Vec<ConnectionResult>,
    alerts: Vec<Alert>,
    workflow_executions: Vec<WorkflowExecution>,
    pipelines: Vec<Pipeline>,
    pipeline_executions: HashMap<Uuid, PipelineExecution>,
    state_instances: Vec<StateExecutionInstance>,
}

/// Thread-safe in-memory implementation of all repositories
///
/// Clones share the same tables.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_worker(&self, worker: Worker) {
        let mut tables = self.tables();
        tables.workers.retain(|w| w.id != worker.id);
        tables.workers.push(worker);
    }

    pub fn worker(&self, worker_id: &str) -> Option<Worker> {
        self.tables()
            .workers
            .iter()
            .find(|w| w.id == worker_id)
            .cloned()
    }

    pub fn put_workflow_execution(&self, execution: WorkflowExecution) {
        let mut tables = self.tables();
        tables.workflow_executions.retain(|e| e.id != execution.id);
        tables.workflow_executions.push(execution);
    }

    pub fn workflow_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.tables()
            .workflow_executions
            .iter()
            .find(|e| e.id == execution_id)
            .cloned()
    }

    pub fn put_pipeline(&self, pipeline: Pipeline) {
        let mut tables = self.tables();
        tables.pipelines.retain(|p| p.id != pipeline.id);
        tables.pipelines.push(pipeline);
    }

    pub fn put_state_instance(&self, instance: StateExecutionInstance) {
        let mut tables = self.tables();
        tables.state_instances.retain(|i| i.id != instance.id);
        tables.state_instances.push(instance);
    }

    pub fn put_alert(&self, alert: Alert) {
        let mut tables = self.tables();
        tables.alerts.retain(|a| a.id != alert.id);
        tables.alerts.push(alert);
    }

    /// Snapshot of every stored alert
    pub fn alerts(&self) -> Vec<Alert> {
        self.tables().alerts.clone()
    }

    /// Snapshot of every cached connection result
    pub fn connection_results(&self) -> Vec<ConnectionResult> {
        self.tables().connection_results.clone()
    }
}

#[async_trait]
impl WorkerRepository for InMemoryStore {
    async fn find_by_id(&self, account_id: &str, worker_id: &str) -> RepositoryResult<Option<Worker>> {
        Ok(self
            .tables()
            .workers
            .iter()
            .find(|w| w.account_id == account_id && w.id == worker_id)
            .cloned())
    }

    async fn list_by_account(&self, account_id: &str) -> RepositoryResult<Vec<Worker>> {
        Ok(self
            .tables()
            .workers
            .iter()
            .filter(|w| w.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn update_scopes(
        &self,
        worker_id: &str,
        include_scopes: &[Scope],
        exclude_scopes: &[Scope],
    ) -> RepositoryResult<bool> {
        let mut tables = self.tables();
        match tables.workers.iter_mut().find(|w| w.id == worker_id) {
            Some(worker) => {
                worker.include_scopes = include_scopes.to_vec();
                worker.exclude_scopes = exclude_scopes.to_vec();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ConnectionResultRepository for InMemoryStore {
    async fn find(
        &self,
        account_id: &str,
        worker_id: &str,
        criteria: &str,
    ) -> RepositoryResult<Option<ConnectionResult>> {
        Ok(self
            .tables()
            .connection_results
            .iter()
            .find(|r| r.account_id == account_id && r.worker_id == worker_id && r.criteria == criteria)
            .cloned())
    }

    async fn upsert(&self, result: &ConnectionResult) -> RepositoryResult<()> {
        let mut tables = self.tables();

        let key_taken = tables.connection_results.iter().any(|r| {
            r.id != result.id
                && r.account_id == result.account_id
                && r.worker_id == result.worker_id
                && r.criteria == result.criteria
        });
        if key_taken {
            return Err(RepositoryError::DuplicateKey(format!(
                "{}/{}/{}",
                result.account_id, result.worker_id, result.criteria
            )));
        }

        match tables.connection_results.iter_mut().find(|r| r.id == result.id) {
            Some(existing) => {
                existing.validated = result.validated;
                existing.last_updated_at = result.last_updated_at;
            }
            None => tables.connection_results.push(result.clone()),
        }
        Ok(())
    }

    async fn delete_by_worker(&self, account_id: &str, worker_id: &str) -> RepositoryResult<u64> {
        let mut tables = self.tables();
        let before = tables.connection_results.len();
        tables
            .connection_results
            .retain(|r| !(r.account_id == account_id && r.worker_id == worker_id));
        Ok((before - tables.connection_results.len()) as u64)
    }
}

#[async_trait]
impl AlertRepository for InMemoryStore {
    async fn find_open(
        &self,
        filter: &AlertFilter,
        alert_type: AlertType,
    ) -> RepositoryResult<Vec<Alert>> {
        Ok(self
            .tables()
            .alerts
            .iter()
            .filter(|a| {
                a.status == AlertStatus::Open && a.alert_type == alert_type && filter.accepts(a)
            })
            .cloned()
            .collect())
    }

    async fn insert(&self, alert: &Alert) -> RepositoryResult<()> {
        let mut tables = self.tables();
        if tables.alerts.iter().any(|a| a.id == alert.id) {
            return Err(RepositoryError::DuplicateKey(alert.id.to_string()));
        }
        tables.alerts.push(alert.clone());
        Ok(())
    }

    async fn close(&self, alert_id: Uuid, closed_at: DateTime<Utc>) -> RepositoryResult<bool> {
        let mut tables = self.tables();
        match tables
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id && a.status == AlertStatus::Open)
        {
            Some(alert) => {
                alert.status = AlertStatus::Closed;
                alert.closed_at = Some(closed_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_closed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<Uuid>> {
        let tables = self.tables();
        let mut closed: Vec<_> = tables
            .alerts
            .iter()
            .filter_map(|a| match (a.status, a.closed_at) {
                (AlertStatus::Closed, Some(closed_at)) if closed_at < cutoff => {
                    Some((closed_at, a.id))
                }
                _ => None,
            })
            .collect();
        closed.sort();
        Ok(closed.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn delete_by_ids(&self, ids: &[Uuid]) -> RepositoryResult<u64> {
        let mut tables = self.tables();
        let before = tables.alerts.len();
        tables.alerts.retain(|a| !ids.contains(&a.id));
        Ok((before - tables.alerts.len()) as u64)
    }
}

#[async_trait]
impl WorkflowExecutionRepository for InMemoryStore {
    async fn find_by_id(
        &self,
        app_id: &str,
        execution_id: Uuid,
    ) -> RepositoryResult<Option<WorkflowExecution>> {
        Ok(self
            .tables()
            .workflow_executions
            .iter()
            .find(|e| e.app_id == app_id && e.id == execution_id)
            .cloned())
    }

    async fn find_active(
        &self,
        app_id: &str,
        workflow_id: &str,
    ) -> RepositoryResult<Option<WorkflowExecution>> {
        Ok(self
            .tables()
            .workflow_executions
            .iter()
            .find(|e| e.app_id == app_id && e.workflow_id == workflow_id && e.status.is_active())
            .cloned())
    }

    async fn find_oldest_queued(
        &self,
        app_id: &str,
        workflow_id: &str,
    ) -> RepositoryResult<Option<WorkflowExecution>> {
        Ok(self
            .tables()
            .workflow_executions
            .iter()
            .filter(|e| {
                e.app_id == app_id
                    && e.workflow_id == workflow_id
                    && e.status == ExecutionStatus::Queued
            })
            .min_by_key(|e| e.created_at)
            .cloned())
    }

    async fn update_status_if(
        &self,
        app_id: &str,
        execution_id: Uuid,
        expected: &[ExecutionStatus],
        status: ExecutionStatus,
        at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let mut tables = self.tables();
        let Some(execution) = tables
            .workflow_executions
            .iter_mut()
            .find(|e| e.app_id == app_id && e.id == execution_id)
        else {
            return Ok(false);
        };

        if !expected.contains(&execution.status) {
            return Ok(false);
        }

        execution.status = status;
        if status == ExecutionStatus::Running {
            execution.started_at = Some(at);
        }
        if status.is_final() {
            execution.ended_at = Some(at);
        }
        Ok(true)
    }

    async fn find_workflows_with_queued(&self) -> RepositoryResult<Vec<(String, String)>> {
        let mut pairs: Vec<_> = self
            .tables()
            .workflow_executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Queued)
            .map(|e| (e.app_id.clone(), e.workflow_id.clone()))
            .collect();
        pairs.sort();
        pairs.dedup();
        Ok(pairs)
    }
}

#[async_trait]
impl PipelineRepository for InMemoryStore {
    async fn find_pipeline(
        &self,
        app_id: &str,
        pipeline_id: &str,
    ) -> RepositoryResult<Option<Pipeline>> {
        Ok(self
            .tables()
            .pipelines
            .iter()
            .find(|p| p.app_id == app_id && p.id == pipeline_id)
            .cloned())
    }

    async fn find_execution(
        &self,
        app_id: &str,
        workflow_execution_id: Uuid,
    ) -> RepositoryResult<Option<PipelineExecution>> {
        Ok(self
            .tables()
            .pipeline_executions
            .get(&workflow_execution_id)
            .filter(|e| e.app_id == app_id)
            .cloned())
    }

    async fn insert_execution(&self, execution: &PipelineExecution) -> RepositoryResult<()> {
        let mut tables = self.tables();
        if tables
            .pipeline_executions
            .contains_key(&execution.workflow_execution_id)
        {
            return Err(RepositoryError::DuplicateKey(
                execution.workflow_execution_id.to_string(),
            ));
        }

        let mut stored = execution.clone();
        stored.version = 0;
        tables
            .pipeline_executions
            .insert(stored.workflow_execution_id, stored);
        Ok(())
    }

    async fn save_execution(&self, execution: &PipelineExecution) -> RepositoryResult<i64> {
        let mut tables = self.tables();
        let conflict = || RepositoryError::ConcurrentModification {
            entity: "pipeline execution",
            id: execution.workflow_execution_id.to_string(),
        };

        let stored = tables
            .pipeline_executions
            .get_mut(&execution.workflow_execution_id)
            .ok_or_else(conflict)?;
        if stored.version != execution.version {
            return Err(conflict());
        }

        let mut saved = execution.clone();
        saved.version = execution.version + 1;
        *stored = saved;
        Ok(execution.version + 1)
    }

    async fn find_recent_successful(
        &self,
        app_id: &str,
        pipeline_id: &str,
        limit: usize,
    ) -> RepositoryResult<Vec<PipelineExecution>> {
        let tables = self.tables();
        let mut executions: Vec<_> = tables
            .pipeline_executions
            .values()
            .filter(|e| {
                e.app_id == app_id
                    && e.pipeline_id == pipeline_id
                    && e.status == ExecutionStatus::Success
            })
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        executions.truncate(limit);
        Ok(executions)
    }

    async fn update_state_eta_map(
        &self,
        app_id: &str,
        pipeline_id: &str,
        state_eta_map: &HashMap<String, i64>,
    ) -> RepositoryResult<bool> {
        let mut tables = self.tables();
        match tables
            .pipelines
            .iter_mut()
            .find(|p| p.app_id == app_id && p.id == pipeline_id)
        {
            Some(pipeline) => {
                pipeline.state_eta_map = state_eta_map.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_unfinished(&self, limit: usize) -> RepositoryResult<Vec<PipelineExecution>> {
        let mut executions: Vec<_> = self
            .tables()
            .pipeline_executions
            .values()
            .filter(|e| !e.status.is_final())
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.started_at);
        executions.truncate(limit);
        Ok(executions)
    }
}

#[async_trait]
impl StateExecutionRepository for InMemoryStore {
    async fn list_by_execution(
        &self,
        app_id: &str,
        execution_id: Uuid,
    ) -> RepositoryResult<Vec<StateExecutionInstance>> {
        let mut instances: Vec<_> = self
            .tables()
            .state_instances
            .iter()
            .filter(|i| i.app_id == app_id && i.execution_id == execution_id)
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }
}
