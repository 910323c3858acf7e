//! State-machine executor
//!
//! Seam to the interpreter that runs workflow graphs. The control plane only
//! asks it to start a queued execution and to read the latest compiled graph
//! of a workflow or pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::domain::execution::ExecutionStatus;
use convoy_core::domain::pipeline::StateMachine;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::error::{RepositoryError, RepositoryResult};

/// Executor contract
#[async_trait]
pub trait StateMachineExecutor: Send + Sync {
    /// Hands a queued execution to the interpreter
    ///
    /// Returns false if the interpreter refused to start it.
    async fn start_queued_execution(&self, app_id: &str, execution_id: Uuid)
    -> RepositoryResult<bool>;

    /// Reads the most recently compiled graph for a workflow or pipeline
    async fn read_latest_state_machine(
        &self,
        app_id: &str,
        origin_id: &str,
    ) -> RepositoryResult<Option<StateMachine>>;
}

/// Executor backed by the shared database
///
/// Starting an execution records its initial state as a `NEW` state
/// instance, which the interpreter picks up.
#[derive(Clone)]
pub struct PgStateMachineExecutor {
    pool: PgPool,
}

impl PgStateMachineExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateMachineExecutor for PgStateMachineExecutor {
    async fn start_queued_execution(
        &self,
        app_id: &str,
        execution_id: Uuid,
    ) -> RepositoryResult<bool> {
        let workflow_id = sqlx::query_scalar::<_, String>(
            "SELECT workflow_id FROM workflow_executions WHERE app_id = $1 AND id = $2",
        )
        .bind(app_id)
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(workflow_id) = workflow_id else {
            tracing::warn!("Execution {} in app {} vanished before start", execution_id, app_id);
            return Ok(false);
        };

        let Some(state_machine) = self.read_latest_state_machine(app_id, &workflow_id).await?
        else {
            tracing::warn!("No compiled state machine for workflow {} in app {}", workflow_id, app_id);
            return Ok(false);
        };

        let Some(initial) = state_machine.state(&state_machine.initial_state_name) else {
            tracing::warn!(
                "Initial state {} missing from state machine of workflow {} in app {}",
                state_machine.initial_state_name,
                workflow_id,
                app_id
            );
            return Ok(false);
        };

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO state_execution_instances (
                id, app_id, execution_id, state_name, state_type, status,
                started_at, ended_at, state_execution_map, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NULL, NULL, '{}', $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(app_id)
        .bind(execution_id)
        .bind(&initial.name)
        .bind(initial.state_type.as_str())
        .bind(ExecutionStatus::New.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            "Execution {} in app {} handed to interpreter at state {}",
            execution_id,
            app_id,
            initial.name
        );
        Ok(true)
    }

    async fn read_latest_state_machine(
        &self,
        app_id: &str,
        origin_id: &str,
    ) -> RepositoryResult<Option<StateMachine>> {
        let row = sqlx::query_as::<_, StateMachineRow>(
            r#"
            SELECT id, app_id, origin_id, initial_state_name, states, transitions, created_at
            FROM state_machines
            WHERE app_id = $1 AND origin_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(app_id)
        .bind(origin_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StateMachine::try_from).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct StateMachineRow {
    id: Uuid,
    app_id: String,
    origin_id: String,
    initial_state_name: String,
    states: serde_json::Value,
    transitions: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<StateMachineRow> for StateMachine {
    type Error = RepositoryError;

    fn try_from(row: StateMachineRow) -> Result<Self, Self::Error> {
        Ok(StateMachine {
            id: row.id,
            app_id: row.app_id,
            origin_id: row.origin_id,
            initial_state_name: row.initial_state_name,
            states: serde_json::from_value(row.states)?,
            transitions: serde_json::from_value(row.transitions)?,
            created_at: row.created_at,
        })
    }
}

/// Executor with canned answers, for embedding and tests
///
/// Starts succeed unless the execution id was marked as failing.
#[derive(Default)]
pub struct StaticExecutor {
    state_machines: Mutex<HashMap<(String, String), StateMachine>>,
    failing: Mutex<Vec<Uuid>>,
    started: Mutex<Vec<Uuid>>,
}

impl StaticExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_state_machine(&self, state_machine: StateMachine) {
        let mut machines = self
            .state_machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        machines.insert(
            (state_machine.app_id.clone(), state_machine.origin_id.clone()),
            state_machine,
        );
    }

    pub fn fail_start_of(&self, execution_id: Uuid) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(execution_id);
    }

    /// Executions started so far, in order
    pub fn started(&self) -> Vec<Uuid> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StateMachineExecutor for StaticExecutor {
    async fn start_queued_execution(
        &self,
        _app_id: &str,
        execution_id: Uuid,
    ) -> RepositoryResult<bool> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&execution_id);
        if failing {
            return Ok(false);
        }

        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(execution_id);
        Ok(true)
    }

    async fn read_latest_state_machine(
        &self,
        app_id: &str,
        origin_id: &str,
    ) -> RepositoryResult<Option<StateMachine>> {
        Ok(self
            .state_machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(app_id.to_string(), origin_id.to_string()))
            .cloned())
    }
}
