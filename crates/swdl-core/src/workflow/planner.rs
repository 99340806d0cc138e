//! Dry-run execution plans.
//!
//! A plan is what a run would do, computed without dispatching anything:
//! defaults applied, parameters merged, batches laid out and per-stage
//! effective settings resolved. Runtime expressions stay unevaluated.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use swdl_types::workflow::{ContractType, StageType, WorkflowDefinition};

use super::dag::{Batch, batch_index_map, build_dag, compute_execution_batches, detect_cycles};
use super::defaults::{apply_defaults, effective_retry, effective_timeout};
use super::definition::WorkflowError;
use super::duration::{duration_seconds_or_zero, format_duration};
use super::validator::{ValidationResult, validate_expressions};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub workflow_id: String,
    pub name: String,
    pub version: String,
    pub parameters: BTreeMap<String, Value>,
    pub batches: Vec<Batch>,
    /// Declaration order.
    pub stages: Vec<ExecutionPlanStage>,
    pub validation: ValidationResult,
    pub workflow_timeout: String,
    pub estimated_timeout_seconds: u64,
    pub estimated_timeout: String,
}

impl ExecutionPlan {
    pub fn stage(&self, id: &str) -> Option<&ExecutionPlanStage> {
        self.stages.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlanStage {
    pub id: String,
    pub name: String,
    pub stage_type: StageType,
    pub batch_index: u32,
    pub primary: Option<String>,
    pub model: Option<String>,
    pub tools: Vec<String>,
    /// Input name -> unevaluated source expression.
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, ContractType>,
    pub context: Vec<String>,
    pub condition: Option<String>,
    pub timeout: String,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub gate: Option<PlanGate>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanGate {
    pub approvers: Vec<String>,
    pub timeout: String,
    pub message: Option<String>,
}

/// Merge caller parameters with declared defaults.
///
/// A caller value wins; otherwise a non-null default applies; a required
/// parameter with neither fails. Caller parameters that are not declared
/// pass through unchanged.
pub fn merge_parameters(
    def: &WorkflowDefinition,
    supplied: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, WorkflowError> {
    let mut merged = supplied.clone();
    let mut missing = Vec::new();

    for (name, spec) in &def.config.parameters {
        if merged.contains_key(name) {
            continue;
        }
        match &spec.default {
            Some(default) if !default.is_null() => {
                merged.insert(name.clone(), default.clone());
            }
            _ if spec.required => missing.push(name.as_str()),
            _ => {}
        }
    }

    if !missing.is_empty() {
        return Err(WorkflowError::Validation(format!(
            "missing required parameter(s): {}",
            missing.join(", ")
        )));
    }
    Ok(merged)
}

/// Build the plan for `def` with the given caller parameters.
///
/// Validation findings are attached to the plan, not raised. Missing required
/// parameters and dependency cycles are raised.
pub fn generate_plan(
    def: &WorkflowDefinition,
    parameters: &BTreeMap<String, Value>,
) -> Result<ExecutionPlan, WorkflowError> {
    let def = apply_defaults(def);
    let parameters = merge_parameters(&def, parameters)?;

    let dag = build_dag(&def.stages)?;
    detect_cycles(&dag)?;
    let validation = validate_expressions(&def, &dag);
    let batches = compute_execution_batches(&dag)?;
    let batch_of = batch_index_map(&batches);

    let stages: Vec<ExecutionPlanStage> = def
        .stages
        .iter()
        .map(|stage| {
            let timeout = effective_timeout(stage);
            let roles = stage.roles.as_ref();
            ExecutionPlanStage {
                id: stage.id.clone(),
                name: stage.name.clone(),
                stage_type: stage.stage_type,
                batch_index: batch_of.get(&stage.id).copied().unwrap_or_default(),
                primary: roles.map(|r| r.primary.clone()),
                model: roles.and_then(|r| r.model.clone()),
                tools: roles.map(|r| r.tools.clone()).unwrap_or_default(),
                inputs: stage
                    .inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.source.clone()))
                    .collect(),
                outputs: stage
                    .outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.output_type))
                    .collect(),
                context: stage.context.clone(),
                condition: stage.condition.clone(),
                timeout_seconds: duration_seconds_or_zero(&timeout),
                timeout,
                max_attempts: effective_retry(stage).max_attempts,
                gate: stage.gate.as_ref().map(|g| PlanGate {
                    approvers: g.approvers.clone(),
                    timeout: g.timeout.clone(),
                    message: g.message.clone(),
                }),
                depends_on: stage.depends_on.clone(),
            }
        })
        .collect();

    let estimated_timeout_seconds: u64 = batches
        .iter()
        .map(|batch| {
            batch
                .stage_ids
                .iter()
                .filter_map(|id| stages.iter().find(|s| &s.id == id))
                .map(|s| s.timeout_seconds)
                .max()
                .unwrap_or(0)
        })
        .sum();

    tracing::debug!(
        workflow_id = %def.id,
        batches = batches.len(),
        valid = validation.valid,
        "execution plan generated"
    );

    Ok(ExecutionPlan {
        workflow_id: def.id.clone(),
        name: def.name.clone(),
        version: def.version.clone(),
        parameters,
        batches,
        stages,
        validation,
        workflow_timeout: def.config.timeout.clone(),
        estimated_timeout_seconds,
        estimated_timeout: format_duration(estimated_timeout_seconds),
    })
}
