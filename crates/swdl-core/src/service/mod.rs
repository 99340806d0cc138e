//! Business logic services (use cases).
//!
//! Services depend on the repository trait, never on a concrete adapter.

pub mod workflow;

pub use workflow::WorkflowService;
