//! Convoy Core
//!
//! Core types for the Convoy continuous-delivery control plane.
//!
//! This crate contains:
//! - Domain types: workers and scopes, tasks, alerts, executions, pipelines
//! - DTOs: messages exchanged between control-plane instances

pub mod domain;
pub mod dto;
