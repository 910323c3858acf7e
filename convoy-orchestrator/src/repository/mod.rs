//! Repository Module
//!
//! Data access layer for the control plane.
//! Each repository is a trait with a PostgreSQL implementation; the
//! in-memory store implements all of them.

pub mod alert;
pub mod connection;
pub mod execution;
pub mod memory;
pub mod pipeline;
pub mod state;
pub mod worker;

// Re-export for convenience
pub use alert::{AlertFilter, AlertRepository, PgAlertRepository};
pub use connection::{ConnectionResultRepository, PgConnectionResultRepository};
pub use execution::{PgWorkflowExecutionRepository, WorkflowExecutionRepository};
pub use memory::InMemoryStore;
pub use pipeline::{PgPipelineRepository, PipelineRepository};
pub use state::{PgStateExecutionRepository, StateExecutionRepository};
pub use worker::{PgWorkerRepository, WorkerRepository};
