//! Workflow definition management service.
//!
//! Stores validated definitions through a [`WorkflowRepository`] and offers
//! the read-only analyses (validation report, execution plan) used by the CLI
//! and HTTP layers before anything runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use swdl_types::error::RepositoryError;
use swdl_types::workflow::WorkflowDefinition;

use crate::repository::workflow::WorkflowRepository;
use crate::workflow::dag::{build_dag, detect_cycles};
use crate::workflow::defaults::apply_defaults;
use crate::workflow::definition::{WorkflowError, validate_definition};
use crate::workflow::planner::{ExecutionPlan, generate_plan};
use crate::workflow::validator::{ValidationResult, validate_expressions};

/// CRUD and analysis over stored workflow definitions.
pub struct WorkflowService<R: WorkflowRepository> {
    repo: Arc<R>,
}

impl<R: WorkflowRepository> Clone for WorkflowService<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<R: WorkflowRepository> WorkflowService<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Store a new definition after structural validation.
    pub async fn create_workflow(
        &self,
        def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        validate_definition(&def)?;
        self.repo.create_definition(&def).await.map_err(|e| match e {
            RepositoryError::Conflict(msg) => WorkflowError::Conflict(msg),
            other => other.into(),
        })?;
        tracing::info!(workflow_id = %def.id, stages = def.stages.len(), "workflow created");
        Ok(def)
    }

    pub async fn get_workflow(&self, id: &str) -> Result<WorkflowDefinition, WorkflowError> {
        self.repo
            .get_definition(id)
            .await?
            .ok_or_else(|| WorkflowError::workflow_not_found(id))
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        Ok(self.repo.list_definitions().await?)
    }

    /// Replace a stored definition. The id inside `def` is forced to `id`.
    pub async fn update_workflow(
        &self,
        id: &str,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        def.id = id.to_string();
        validate_definition(&def)?;
        self.repo.update_definition(&def).await.map_err(|e| match e {
            RepositoryError::NotFound => WorkflowError::workflow_not_found(id),
            other => other.into(),
        })?;
        tracing::info!(workflow_id = %id, "workflow updated");
        Ok(def)
    }

    pub async fn delete_workflow(&self, id: &str) -> Result<(), WorkflowError> {
        if !self.repo.delete_definition(id).await? {
            return Err(WorkflowError::workflow_not_found(id));
        }
        tracing::info!(workflow_id = %id, "workflow deleted");
        Ok(())
    }

    /// Full static report for a definition that need not be stored.
    ///
    /// Structural problems and cycles are raised; expression findings are
    /// returned in the report.
    pub fn validate_workflow(def: &WorkflowDefinition) -> Result<ValidationResult, WorkflowError> {
        validate_definition(def)?;
        let def = apply_defaults(def);
        let dag = build_dag(&def.stages)?;
        detect_cycles(&dag)?;
        Ok(validate_expressions(&def, &dag))
    }

    /// Plan a stored workflow.
    pub async fn plan_workflow(
        &self,
        id: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<ExecutionPlan, WorkflowError> {
        let def = self.get_workflow(id).await?;
        generate_plan(&def, parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::workflow::testing::{agent_stage, with_output, with_param, workflow};
    use crate::workflow::validator::IssueCategory;
    use serde_json::json;
    use swdl_types::workflow::ContractType;

    fn service() -> WorkflowService<InMemoryWorkflowRepository> {
        WorkflowService::new(Arc::new(InMemoryWorkflowRepository::new()))
    }

    #[tokio::test]
    async fn test_create_get_list_delete() {
        let svc = service();
        let def = workflow(vec![agent_stage("a", &[])]);

        svc.create_workflow(def.clone()).await.unwrap();
        assert_eq!(svc.get_workflow("test-wf").await.unwrap(), def);
        assert_eq!(svc.list_workflows().await.unwrap().len(), 1);

        let dup = svc.create_workflow(def).await.unwrap_err();
        assert!(matches!(dup, WorkflowError::Conflict(_)));

        svc.delete_workflow("test-wf").await.unwrap();
        assert!(matches!(
            svc.get_workflow("test-wf").await,
            Err(WorkflowError::NotFound { kind: "workflow", .. })
        ));
        assert!(matches!(
            svc.delete_workflow("test-wf").await,
            Err(WorkflowError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_definition() {
        let mut def = workflow(vec![agent_stage("a", &[])]);
        def.name = "  ".to_string();
        let err = service().create_workflow(def).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let svc = service();
        let def = workflow(vec![agent_stage("a", &[])]);
        assert!(matches!(
            svc.update_workflow("test-wf", def.clone()).await,
            Err(WorkflowError::NotFound { .. })
        ));

        svc.create_workflow(def.clone()).await.unwrap();
        let mut changed = def;
        changed.id = "ignored".to_string();
        changed.description = Some("second".to_string());
        let stored = svc.update_workflow("test-wf", changed).await.unwrap();
        assert_eq!(stored.id, "test-wf");
        assert_eq!(
            svc.get_workflow("test-wf").await.unwrap().description.as_deref(),
            Some("second")
        );
    }

    #[test]
    fn test_validate_reports_expression_issues() {
        let mut reader = agent_stage("b", &[]);
        reader.condition = Some("${{ stages.a.outputs.summary == 'x' }}".to_string());
        let def = workflow(vec![
            with_output(agent_stage("a", &[]), "summary", ContractType::String),
            reader,
        ]);

        let report = WorkflowService::<InMemoryWorkflowRepository>::validate_workflow(&def).unwrap();
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].category, IssueCategory::Dag);
    }

    #[test]
    fn test_validate_raises_cycles() {
        let def = workflow(vec![agent_stage("a", &["b"]), agent_stage("b", &["a"])]);
        let err = WorkflowService::<InMemoryWorkflowRepository>::validate_workflow(&def).unwrap_err();
        assert!(matches!(err, WorkflowError::Cycle { .. }));
    }

    #[tokio::test]
    async fn test_plan_stored_workflow() {
        let svc = service();
        let def = with_param(
            workflow(vec![agent_stage("a", &[]), agent_stage("b", &["a"])]),
            "topic",
            true,
            None,
        );
        svc.create_workflow(def).await.unwrap();

        let params = BTreeMap::from([("topic".to_string(), json!("rust"))]);
        let plan = svc.plan_workflow("test-wf", &params).await.unwrap();
        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.parameters["topic"], json!("rust"));

        assert!(matches!(
            svc.plan_workflow("test-wf", &BTreeMap::new()).await,
            Err(WorkflowError::Validation(_))
        ));
    }
}
