//! Worker domain model
//!
//! Represents a remote agent (delegate) that executes tasks on behalf of the
//! control plane, together with the scopes restricting which tasks it accepts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A remote agent that can execute tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier for the worker
    pub id: String,

    /// Account owning this worker
    pub account_id: String,

    /// Host name reported at registration
    pub host_name: String,

    /// When this worker was first registered
    pub registered_at: DateTime<Utc>,

    /// Last time this worker sent a heartbeat
    pub last_heartbeat_at: DateTime<Utc>,

    /// Administrative status of the worker
    pub status: WorkerStatus,

    /// Scopes of which at least one must match a task (empty means any task)
    #[serde(default)]
    pub include_scopes: Vec<Scope>,

    /// Scopes of which none may match a task
    #[serde(default)]
    pub exclude_scopes: Vec<Scope>,
}

impl Worker {
    /// Returns true if this worker embeds a copy of the given scope
    pub fn holds_scope(&self, scope_id: &str) -> bool {
        self.include_scopes
            .iter()
            .chain(self.exclude_scopes.iter())
            .any(|scope| scope.id == scope_id)
    }
}

/// Administrative status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Worker is approved and may receive tasks
    Enabled,

    /// Worker registered but an administrator has not approved it yet
    WaitingForApproval,

    /// Worker was disabled by an administrator
    Disabled,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Enabled => "Enabled",
            WorkerStatus::WaitingForApproval => "WaitingForApproval",
            WorkerStatus::Disabled => "Disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Enabled" => Some(WorkerStatus::Enabled),
            "WaitingForApproval" => Some(WorkerStatus::WaitingForApproval),
            "Disabled" => Some(WorkerStatus::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of a deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvironmentType {
    Prod,
    NonProd,
}

/// Classification of a task used for scope matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskGroup {
    Deploy,
    Script,
    Command,
    Http,
    Jenkins,
    Bamboo,
    Docker,
    Aws,
    Gcp,
    Kubernetes,
    Helm,
    Git,
}

/// Inclusion/exclusion predicate restricting which tasks a worker may accept
///
/// Each non-empty list is a dimension; dimensions are ANDed together and the
/// values inside one dimension are ORed. An empty list means "don't care".
/// A scope with every list empty is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Identifier shared by every embedded copy of this scope
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub environment_types: Vec<EnvironmentType>,

    #[serde(default)]
    pub task_groups: Vec<TaskGroup>,

    #[serde(default)]
    pub applications: Vec<String>,

    #[serde(default)]
    pub environments: Vec<String>,

    #[serde(default)]
    pub infrastructure_mappings: Vec<String>,
}

impl Scope {
    /// A scope must constrain at least one dimension
    pub fn is_valid(&self) -> bool {
        !(self.environment_types.is_empty()
            && self.task_groups.is_empty()
            && self.applications.is_empty()
            && self.environments.is_empty()
            && self.infrastructure_mappings.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(id: &str) -> Scope {
        Scope {
            id: id.to_string(),
            name: format!("scope-{id}"),
            environment_types: vec![],
            task_groups: vec![],
            applications: vec![],
            environments: vec![],
            infrastructure_mappings: vec![],
        }
    }

    #[test]
    fn test_empty_scope_is_invalid() {
        assert!(!scope("s1").is_valid());
    }

    #[test]
    fn test_scope_with_single_dimension_is_valid() {
        let mut s = scope("s1");
        s.task_groups.push(TaskGroup::Deploy);
        assert!(s.is_valid());
    }

    #[test]
    fn test_worker_holds_scope() {
        let mut include = scope("inc");
        include.applications.push("app".to_string());
        let worker = Worker {
            id: "w1".to_string(),
            account_id: "acct".to_string(),
            host_name: "host".to_string(),
            registered_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
            status: WorkerStatus::Enabled,
            include_scopes: vec![include],
            exclude_scopes: vec![],
        };

        assert!(worker.holds_scope("inc"));
        assert!(!worker.holds_scope("other"));
    }

    #[test]
    fn test_worker_status_roundtrip_names() {
        for status in [
            WorkerStatus::Enabled,
            WorkerStatus::WaitingForApproval,
            WorkerStatus::Disabled,
        ] {
            assert_eq!(WorkerStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(WorkerStatus::parse("Unknown"), None);
    }
}
