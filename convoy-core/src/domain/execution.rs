//! Execution domain types
//!
//! Workflow executions and the per-state records the state-machine
//! interpreter persists while running them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A single run of a workflow or pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub app_id: String,
    /// Workflow or pipeline this execution runs
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
    pub name: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowType {
    Orchestration,
    Pipeline,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Orchestration => "Orchestration",
            WorkflowType::Pipeline => "Pipeline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Orchestration" => Some(WorkflowType::Orchestration),
            "Pipeline" => Some(WorkflowType::Pipeline),
            _ => None,
        }
    }
}

/// Execution status shared by workflows, pipelines and states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    New,
    Queued,
    Starting,
    Running,
    Paused,
    Pausing,
    Waiting,
    Success,
    Failed,
    Error,
    Aborted,
    Rejected,
    Expired,
}

/// Statuses in which an execution occupies its workflow
pub const ACTIVE_STATUSES: [ExecutionStatus; 5] = [
    ExecutionStatus::Starting,
    ExecutionStatus::Running,
    ExecutionStatus::Paused,
    ExecutionStatus::Pausing,
    ExecutionStatus::Waiting,
];

/// Statuses that never change again
pub const FINAL_STATUSES: [ExecutionStatus; 6] = [
    ExecutionStatus::Success,
    ExecutionStatus::Failed,
    ExecutionStatus::Error,
    ExecutionStatus::Aborted,
    ExecutionStatus::Rejected,
    ExecutionStatus::Expired,
];

/// Statuses from which a queued execution may still be started
pub const STARTABLE_STATUSES: [ExecutionStatus; 2] = [ExecutionStatus::New, ExecutionStatus::Queued];

impl ExecutionStatus {
    pub fn is_final(&self) -> bool {
        FINAL_STATUSES.contains(self)
    }

    pub fn is_active(&self) -> bool {
        ACTIVE_STATUSES.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::New => "NEW",
            ExecutionStatus::Queued => "QUEUED",
            ExecutionStatus::Starting => "STARTING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Paused => "PAUSED",
            ExecutionStatus::Pausing => "PAUSING",
            ExecutionStatus::Waiting => "WAITING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Error => "ERROR",
            ExecutionStatus::Aborted => "ABORTED",
            ExecutionStatus::Rejected => "REJECTED",
            ExecutionStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "NEW" => ExecutionStatus::New,
            "QUEUED" => ExecutionStatus::Queued,
            "STARTING" => ExecutionStatus::Starting,
            "RUNNING" => ExecutionStatus::Running,
            "PAUSED" => ExecutionStatus::Paused,
            "PAUSING" => ExecutionStatus::Pausing,
            "WAITING" => ExecutionStatus::Waiting,
            "SUCCESS" => ExecutionStatus::Success,
            "FAILED" => ExecutionStatus::Failed,
            "ERROR" => ExecutionStatus::Error,
            "ABORTED" => ExecutionStatus::Aborted,
            "REJECTED" => ExecutionStatus::Rejected,
            "EXPIRED" => ExecutionStatus::Expired,
            _ => return None,
        };
        Some(status)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of a state in a compiled state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Approval,
    EnvState,
    Wait,
    ShellScript,
    Http,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Approval => "APPROVAL",
            StateType::EnvState => "ENV_STATE",
            StateType::Wait => "WAIT",
            StateType::ShellScript => "SHELL_SCRIPT",
            StateType::Http => "HTTP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVAL" => Some(StateType::Approval),
            "ENV_STATE" => Some(StateType::EnvState),
            "WAIT" => Some(StateType::Wait),
            "SHELL_SCRIPT" => Some(StateType::ShellScript),
            "HTTP" => Some(StateType::Http),
            _ => None,
        }
    }
}

/// Persisted record of one state's run within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateExecutionInstance {
    pub id: Uuid,
    pub app_id: String,
    pub execution_id: Uuid,
    pub state_name: String,
    pub state_type: StateType,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Payloads keyed by the name of the state that emitted them
    #[serde(default)]
    pub state_execution_map: HashMap<String, StateExecutionData>,
    pub created_at: DateTime<Utc>,
}

/// Strongly-typed payload emitted by a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StateExecutionData {
    Approval {
        approval_id: String,
        #[serde(default)]
        approved_by: Option<String>,
        #[serde(default)]
        comments: Option<String>,
    },
    EnvState {
        workflow_id: String,
        env_id: String,
        #[serde(default)]
        workflow_execution_id: Option<Uuid>,
        #[serde(default)]
        error_msg: Option<String>,
    },
    Generic {
        #[serde(default)]
        output: serde_json::Value,
    },
}
