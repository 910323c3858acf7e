//! Pipeline domain types
//!
//! A pipeline is compiled into a linear state machine (approval and
//! environment-deployment states chained by a single success edge). The
//! pipeline execution holds the human-facing stage view derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::domain::execution::{ExecutionStatus, StateExecutionData, StateType, WorkflowExecution};

/// Pipeline definition as seen by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub app_id: String,
    pub name: String,
    /// Historical average duration per state name, in milliseconds
    #[serde(default)]
    pub state_eta_map: HashMap<String, i64>,
}

/// A single run of a pipeline, keyed by its workflow execution id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub workflow_execution_id: Uuid,
    pub app_id: String,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stage_executions: Vec<PipelineStageExecution>,
    /// ETA table copied from the pipeline when the run was created
    #[serde(default)]
    pub state_eta_map: HashMap<String, i64>,
    /// Optimistic concurrency version, bumped on every save
    pub version: i64,
}

/// Projected view of one pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStageExecution {
    pub state_name: String,
    pub state_type: StateType,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Expected duration in milliseconds, for stages that have not started
    pub estimated_millis: Option<i64>,
    pub state_execution_data: Option<StateExecutionData>,
    #[serde(default)]
    pub workflow_executions: Vec<WorkflowExecution>,
    pub message: Option<String>,
}

impl PipelineStageExecution {
    /// Placeholder for a stage whose state has not produced an instance yet
    pub fn queued(state: &StateDefinition, estimated_millis: Option<i64>) -> Self {
        Self {
            state_name: state.name.clone(),
            state_type: state.state_type,
            status: ExecutionStatus::Queued,
            started_at: None,
            ended_at: None,
            estimated_millis,
            state_execution_data: None,
            workflow_executions: Vec::new(),
            message: None,
        }
    }

    /// Duration of the stage in milliseconds, when both ends are known
    pub fn duration_millis(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) if end > start => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Compiled state machine graph of a workflow or pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachine {
    pub id: Uuid,
    pub app_id: String,
    /// Workflow or pipeline this graph was compiled from
    pub origin_id: String,
    pub initial_state_name: String,
    pub states: Vec<StateDefinition>,
    pub transitions: Vec<Transition>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    pub state_type: StateType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub transition_type: TransitionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionType {
    Success,
    Failure,
}

/// The graph and the chain it describes have diverged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    /// A transition or the initial state names a state that is not defined
    MissingState(String),
    /// Following the success edges revisits a state
    Cycle(String),
}

impl std::fmt::Display for StateMachineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateMachineError::MissingState(name) => write!(f, "state '{name}' is not defined"),
            StateMachineError::Cycle(name) => write!(f, "state '{name}' is revisited"),
        }
    }
}

impl std::error::Error for StateMachineError {}

impl StateMachine {
    pub fn state(&self, name: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Follows the success edge out of the given state
    pub fn next_state(&self, name: &str) -> Result<Option<&StateDefinition>, StateMachineError> {
        let Some(transition) = self
            .transitions
            .iter()
            .find(|t| t.from == name && t.transition_type == TransitionType::Success)
        else {
            return Ok(None);
        };

        self.state(&transition.to)
            .map(Some)
            .ok_or_else(|| StateMachineError::MissingState(transition.to.clone()))
    }

    /// Walks the chain from the initial state
    pub fn linear_chain(&self) -> Result<Vec<&StateDefinition>, StateMachineError> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(
            self.state(&self.initial_state_name)
                .ok_or_else(|| StateMachineError::MissingState(self.initial_state_name.clone()))?,
        );

        while let Some(state) = current {
            if !visited.insert(state.name.as_str()) {
                return Err(StateMachineError::Cycle(state.name.clone()));
            }
            chain.push(state);
            current = self.next_state(&state.name)?;
        }

        Ok(chain)
    }
}
