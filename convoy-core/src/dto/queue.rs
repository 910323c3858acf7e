//! Queue DTOs

use serde::{Deserialize, Serialize};

/// Published whenever a workflow may be able to start its next queued run
///
/// Delivery is at-least-once and unordered across workflows, so handlers
/// must tolerate duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub app_id: String,
    pub workflow_id: String,
}

impl ExecutionEvent {
    pub fn new(app_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            workflow_id: workflow_id.into(),
        }
    }
}
