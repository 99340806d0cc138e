//! Workflow repository trait definition.
//!
//! Storage interface for workflow definitions, executions with their steps,
//! and the append-only execution event log. `swdl-infra` implements it on
//! SQLite; [`super::memory::InMemoryWorkflowRepository`] keeps everything in
//! process.

use serde_json::Value;
use swdl_types::error::RepositoryError;
use swdl_types::execution::{
    ExecutionEvent, ExecutionEventType, ExecutionStatus, ExecutionStep, WorkflowExecution,
};
use swdl_types::workflow::WorkflowDefinition;
use uuid::Uuid;

/// Filter for [`WorkflowRepository::list_executions`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    /// Zero means no limit.
    pub limit: u32,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        self.workflow_id
            .as_deref()
            .is_none_or(|id| execution.workflow_id == id)
            && self.status.is_none_or(|s| execution.status == s)
    }
}

/// Repository trait for workflow persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Insert a new definition. Fails with `Conflict` if the id is taken.
    fn create_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_definition(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// All definitions ordered by id.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Replace an existing definition. Fails with `NotFound` if absent.
    fn update_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Returns `true` if the definition existed.
    fn delete_definition(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert an execution together with its steps.
    fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load an execution with its steps in declaration order.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// Executions matching `filter`, most recently started first.
    fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// Persist execution-level fields: status, error, timestamps, parameters.
    /// Steps are left untouched.
    fn update_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist one step's current state.
    fn update_step(
        &self,
        execution_id: &Uuid,
        step: &ExecutionStep,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Append an event, assigning the next sequence number for the execution.
    fn append_event(
        &self,
        execution_id: &Uuid,
        event_type: ExecutionEventType,
        payload: Value,
    ) -> impl std::future::Future<Output = Result<ExecutionEvent, RepositoryError>> + Send;

    /// Events with a sequence greater than `after_sequence`, in order.
    fn list_events(
        &self,
        execution_id: &Uuid,
        after_sequence: u64,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionEvent>, RepositoryError>> + Send;
}
