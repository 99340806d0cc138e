//! In-process [`WorkflowRepository`] backed by `DashMap`.
//!
//! Used by `--ephemeral` runs and by tests. All reads return clones so no
//! `DashMap` guard outlives a call.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use swdl_types::error::RepositoryError;
use swdl_types::execution::{ExecutionEvent, ExecutionEventType, ExecutionStep, WorkflowExecution};
use swdl_types::workflow::WorkflowDefinition;
use uuid::Uuid;

use super::workflow::{ExecutionFilter, WorkflowRepository};

/// Cloning shares the same underlying maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowRepository {
    definitions: Arc<DashMap<String, WorkflowDefinition>>,
    executions: Arc<DashMap<Uuid, WorkflowExecution>>,
    events: Arc<DashMap<Uuid, Vec<ExecutionEvent>>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn create_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        match self.definitions.entry(def.id.clone()) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "workflow '{}' already exists",
                def.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(def.clone());
                Ok(())
            }
        }
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.get(id).map(|r| r.value().clone()))
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<WorkflowDefinition> =
            self.definitions.iter().map(|r| r.value().clone()).collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn update_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        match self.definitions.get_mut(&def.id) {
            Some(mut existing) => {
                *existing = def.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.definitions.remove(id).is_some())
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        match self.executions.entry(execution.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "execution '{}' already exists",
                execution.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(execution.clone());
                Ok(())
            }
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.executions.get(id).map(|r| r.value().clone()))
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut found: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        // v7 ids sort by creation time.
        found.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        if filter.limit > 0 {
            found.truncate(filter.limit as usize);
        }
        Ok(found)
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let mut stored = self
            .executions
            .get_mut(&execution.id)
            .ok_or(RepositoryError::NotFound)?;
        stored.status = execution.status;
        stored.parameters = execution.parameters.clone();
        stored.started_at = execution.started_at;
        stored.completed_at = execution.completed_at;
        stored.error_message = execution.error_message.clone();
        Ok(())
    }

    async fn update_step(&self, execution_id: &Uuid, step: &ExecutionStep) -> Result<(), RepositoryError> {
        let mut stored = self
            .executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        let slot = stored
            .step_mut(&step.stage_id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = step.clone();
        Ok(())
    }

    async fn append_event(
        &self,
        execution_id: &Uuid,
        event_type: ExecutionEventType,
        payload: Value,
    ) -> Result<ExecutionEvent, RepositoryError> {
        if !self.executions.contains_key(execution_id) {
            return Err(RepositoryError::NotFound);
        }
        // The entry guard serializes sequence assignment per execution.
        let mut log = self.events.entry(*execution_id).or_default();
        let event = ExecutionEvent {
            execution_id: *execution_id,
            sequence: log.len() as u64 + 1,
            event_type,
            payload,
            created_at: Utc::now(),
        };
        log.push(event.clone());
        Ok(event)
    }

    async fn list_events(
        &self,
        execution_id: &Uuid,
        after_sequence: u64,
    ) -> Result<Vec<ExecutionEvent>, RepositoryError> {
        Ok(self
            .events
            .get(execution_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.sequence > after_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
