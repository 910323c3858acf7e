//! Alert domain types
//!
//! Alerts are operational notices tied to execution health. Each alert type
//! has a fixed category and severity, and a payload that decides when two
//! alerts describe the same condition (the alert fingerprint).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::task::Task;

/// App id used for alerts that are scoped to a whole account
pub const GLOBAL_APP_ID: &str = "__GLOBAL_APP_ID__";

/// A persisted alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub account_id: String,
    /// Owning app, or [`GLOBAL_APP_ID`] for account-wide alerts
    pub app_id: String,
    pub alert_type: AlertType,
    pub status: AlertStatus,
    pub category: AlertCategory,
    pub severity: AlertSeverity,
    pub title: String,
    pub payload: AlertPayload,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Builds a new open alert for the given payload
    pub fn open(account_id: impl Into<String>, app_id: impl Into<String>, payload: AlertPayload) -> Self {
        let alert_type = payload.alert_type();
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            app_id: app_id.into(),
            alert_type,
            status: AlertStatus::Open,
            category: alert_type.category(),
            severity: alert_type.severity(),
            title: payload.title(),
            payload,
            created_at: Utc::now(),
            closed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    Open,
    Closed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "Open",
            AlertStatus::Closed => "Closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertCategory {
    Setup,
    Approval,
    ManualIntervention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Warning,
    Error,
}

/// Kind of alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    ApprovalNeeded,
    ManualInterventionNeeded,
    NoActiveWorkers,
    NoEligibleWorkers,
}

impl AlertType {
    pub fn category(&self) -> AlertCategory {
        match self {
            AlertType::ApprovalNeeded => AlertCategory::Approval,
            AlertType::ManualInterventionNeeded => AlertCategory::ManualIntervention,
            AlertType::NoActiveWorkers | AlertType::NoEligibleWorkers => AlertCategory::Setup,
        }
    }

    pub fn severity(&self) -> AlertSeverity {
        match self {
            AlertType::ApprovalNeeded | AlertType::ManualInterventionNeeded => {
                AlertSeverity::Warning
            }
            AlertType::NoActiveWorkers | AlertType::NoEligibleWorkers => AlertSeverity::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::ApprovalNeeded => "ApprovalNeeded",
            AlertType::ManualInterventionNeeded => "ManualInterventionNeeded",
            AlertType::NoActiveWorkers => "NoActiveWorkers",
            AlertType::NoEligibleWorkers => "NoEligibleWorkers",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ApprovalNeeded" => Some(AlertType::ApprovalNeeded),
            "ManualInterventionNeeded" => Some(AlertType::ManualInterventionNeeded),
            "NoActiveWorkers" => Some(AlertType::NoActiveWorkers),
            "NoEligibleWorkers" => Some(AlertType::NoEligibleWorkers),
            _ => None,
        }
    }
}

/// Type-specific alert data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AlertPayload {
    ApprovalNeeded {
        approval_id: String,
        execution_id: Uuid,
        name: String,
    },
    ManualIntervention {
        state_execution_instance_id: Uuid,
        execution_id: Uuid,
        name: String,
    },
    NoActiveWorkers {
        account_id: String,
    },
    NoEligibleWorkers {
        task: Task,
    },
}

impl AlertPayload {
    pub fn alert_type(&self) -> AlertType {
        match self {
            AlertPayload::ApprovalNeeded { .. } => AlertType::ApprovalNeeded,
            AlertPayload::ManualIntervention { .. } => AlertType::ManualInterventionNeeded,
            AlertPayload::NoActiveWorkers { .. } => AlertType::NoActiveWorkers,
            AlertPayload::NoEligibleWorkers { .. } => AlertType::NoEligibleWorkers,
        }
    }

    /// Returns true if both payloads describe the same alert condition
    ///
    /// Only the fields relevant to each alert type take part; a blocked task
    /// matches another one with the same routing requirements even when the
    /// task ids differ.
    pub fn matches(&self, other: &AlertPayload) -> bool {
        match (self, other) {
            (
                AlertPayload::ApprovalNeeded { approval_id: a, .. },
                AlertPayload::ApprovalNeeded { approval_id: b, .. },
            ) => a == b,
            (
                AlertPayload::ManualIntervention {
                    state_execution_instance_id: a,
                    ..
                },
                AlertPayload::ManualIntervention {
                    state_execution_instance_id: b,
                    ..
                },
            ) => a == b,
            (
                AlertPayload::NoActiveWorkers { account_id: a },
                AlertPayload::NoActiveWorkers { account_id: b },
            ) => a == b,
            (
                AlertPayload::NoEligibleWorkers { task: a },
                AlertPayload::NoEligibleWorkers { task: b },
            ) => {
                a.account_id == b.account_id
                    && a.app_id == b.app_id
                    && a.env_id == b.env_id
                    && a.infrastructure_mapping_id == b.infrastructure_mapping_id
                    && a.task_group == b.task_group
                    && a.task_type == b.task_type
            }
            _ => false,
        }
    }

    /// Human-facing alert title
    pub fn title(&self) -> String {
        match self {
            AlertPayload::ApprovalNeeded { name, .. } => format!("{name} needs approval"),
            AlertPayload::ManualIntervention { name, .. } => {
                format!("{name} requires manual action")
            }
            AlertPayload::NoActiveWorkers { .. } => {
                "No workers are available for this account".to_string()
            }
            AlertPayload::NoEligibleWorkers { task } => match &task.task_group {
                Some(group) => format!("No workers are eligible to execute {group:?} tasks"),
                None => format!("No workers are eligible to execute {} tasks", task.task_type),
            },
        }
    }

    /// Execution the alert was raised for, if any
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            AlertPayload::ApprovalNeeded { execution_id, .. }
            | AlertPayload::ManualIntervention { execution_id, .. } => Some(*execution_id),
            AlertPayload::NoActiveWorkers { .. } | AlertPayload::NoEligibleWorkers { .. } => None,
        }
    }
}
