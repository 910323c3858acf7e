//! Task domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::worker::{EnvironmentType, TaskGroup};

/// Unit of work submitted for execution on a worker
///
/// Immutable once submitted. The routing fields are resolved at submission so
/// that scope matching never needs to look up the environment again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub account_id: String,
    pub app_id: Option<String>,
    pub env_id: Option<String>,
    pub env_type: Option<EnvironmentType>,
    pub infrastructure_mapping_id: Option<String>,
    pub task_group: Option<TaskGroup>,
    /// Task type name, e.g. "HTTP" or "SHELL_SCRIPT"
    pub task_type: String,
    /// Connectivity criteria a worker must have validated to be whitelisted
    #[serde(default)]
    pub criteria: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Cached outcome of a worker's connectivity check for one criterion
///
/// Keyed by (account, worker, criteria); the latest write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionResult {
    pub id: Uuid,
    pub account_id: String,
    pub worker_id: String,
    pub criteria: String,
    pub validated: bool,
    pub last_updated_at: DateTime<Utc>,
}

impl ConnectionResult {
    pub fn new(
        account_id: impl Into<String>,
        worker_id: impl Into<String>,
        criteria: impl Into<String>,
        validated: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            worker_id: worker_id.into(),
            criteria: criteria.into(),
            validated,
            last_updated_at: Utc::now(),
        }
    }
}
