//! Convoy Orchestrator
//!
//! Control plane of the continuous-delivery system:
//! - Routing: which worker may run a task, and which is whitelisted
//! - Alerts: deduplicated operator alerts that heal themselves
//! - Dispatch: admission of queued workflow executions, one at a time per workflow
//! - Projection: the stage-by-stage view of pipeline executions and their ETAs
//!
//! External collaborators (store, lock, queue, executor, notifications) are
//! traits with PostgreSQL and in-memory implementations.

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod lock;
pub mod notification;
pub mod queue;
pub mod repository;
pub mod service;
