//! Expression context assembled from a live execution.
//!
//! Rebuilt from the execution record whenever a batch starts, so each stage
//! sees the outputs and statuses of everything that settled before it.

use serde_json::{Map, Value, json};
use swdl_types::execution::WorkflowExecution;

use super::expression::ExpressionContext;

/// Build the six expression namespaces for `execution`.
///
/// - `parameters`: merged run parameters
/// - `env`: `config.env` of the snapshot (overrides already applied)
/// - `context`: `context.values` of the snapshot
/// - `run`: execution id, status and start time
/// - `workflow`: id, name and version
/// - `stages`: one `{outputs, status}` entry per step
pub fn expression_context(execution: &WorkflowExecution) -> ExpressionContext {
    let def = &execution.definition_snapshot;

    let context_values = def
        .context
        .as_ref()
        .map(|c| c.values.clone())
        .unwrap_or_default();

    let mut ctx = ExpressionContext::new()
        .with_parameters(execution.parameters.clone())
        .with_env(def.config.env.clone())
        .with_context(context_values)
        .with_run(json!({
            "id": execution.id.to_string(),
            "status": execution.status.as_str(),
            "started_at": execution.started_at.to_rfc3339(),
        }))
        .with_workflow(json!({
            "id": def.id,
            "name": def.name,
            "version": def.version,
        }));

    for step in &execution.steps {
        let outputs = step
            .output
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        ctx.set_stage(&step.stage_id, step.status.as_str(), outputs);
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::{Namespace, evaluate_str};
    use crate::workflow::testing::{agent_stage, workflow};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use swdl_types::execution::{ExecutionStatus, ExecutionStep, StepStatus};
    use swdl_types::workflow::{ContextConfig, StageType};
    use uuid::Uuid;

    fn execution() -> WorkflowExecution {
        let mut def = workflow(vec![agent_stage("a", &[]), agent_stage("b", &["a"])]);
        def.config.env.insert("REGION".to_string(), "eu".to_string());
        def.context = Some(ContextConfig {
            modules: Vec::new(),
            values: BTreeMap::from([("team".to_string(), json!("core"))]),
        });

        let mut done = ExecutionStep::pending("a", "a", StageType::Agent, 0);
        done.status = StepStatus::Completed;
        done.output = Some(json!({"summary": "ok"}));

        WorkflowExecution {
            id: Uuid::now_v7(),
            workflow_id: def.id.clone(),
            workflow_name: def.name.clone(),
            status: ExecutionStatus::Running,
            parameters: BTreeMap::from([("topic".to_string(), json!("rust"))]),
            definition_snapshot: def,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            steps: vec![done, ExecutionStep::pending("b", "b", StageType::Agent, 1)],
        }
    }

    #[test]
    fn test_namespaces_populated() {
        let exec = execution();
        let ctx = expression_context(&exec);

        assert_eq!(evaluate_str("parameters.topic", &ctx).unwrap(), json!("rust"));
        assert_eq!(evaluate_str("env.REGION", &ctx).unwrap(), json!("eu"));
        assert_eq!(evaluate_str("context.team", &ctx).unwrap(), json!("core"));
        assert_eq!(evaluate_str("workflow.id", &ctx).unwrap(), json!("test-wf"));
        assert_eq!(
            evaluate_str("run.id", &ctx).unwrap(),
            json!(exec.id.to_string())
        );
    }

    #[test]
    fn test_stage_entries() {
        let ctx = expression_context(&execution());
        assert_eq!(
            evaluate_str("stages.a.outputs.summary", &ctx).unwrap(),
            json!("ok")
        );
        assert_eq!(
            evaluate_str("stages.a.status == 'completed'", &ctx).unwrap(),
            json!(true)
        );
        assert_eq!(evaluate_str("stages.b.status", &ctx).unwrap(), json!("pending"));
        assert_eq!(
            ctx.namespace(Namespace::Stages)["b"]["outputs"],
            json!({})
        );
    }
}
