//! Repository trait definitions (ports) and the in-memory adapter.
//!
//! `swdl-infra` provides the SQLite adapter. The core crate never depends on
//! a specific storage technology.

pub mod memory;
pub mod workflow;

pub use memory::InMemoryWorkflowRepository;
pub use workflow::{ExecutionFilter, WorkflowRepository};
