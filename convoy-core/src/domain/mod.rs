//! Core domain types
//!
//! This module contains the domain structures shared by every control-plane
//! component. They carry structure only: persistence lives in the
//! orchestrator's repositories and decisions in its services.

pub mod alert;
pub mod execution;
pub mod pipeline;
pub mod task;
pub mod worker;
