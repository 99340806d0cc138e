//! Shared domain types for SWDL.
//!
//! This crate contains the value objects used across the workspace:
//! workflow definitions, executions, the event log, configuration and the
//! repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod execution;
pub mod workflow;
