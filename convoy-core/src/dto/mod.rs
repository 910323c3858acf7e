//! Data Transfer Objects for inter-service communication
//!
//! Messages published on the control plane's durable queues.

pub mod queue;
