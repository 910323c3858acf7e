//! Service Module
//!
//! Business logic layer of the control plane.
//! Services hold their collaborators as trait objects and contain the
//! routing, alerting, dispatch and projection rules.

pub mod alert;
pub mod dispatch;
pub mod projection;
pub mod routing;
pub mod scope;

// Re-export for convenience
pub use alert::{AlertService, SweepSettings};
pub use dispatch::{DispatchOutcome, DispatchSettings, ExecutionQueueDispatcher};
pub use projection::PipelineStateProjector;
pub use routing::RoutingEngine;
pub use scope::ScopeService;
