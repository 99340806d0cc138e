//! Static analysis of expressions embedded in a workflow definition.
//!
//! Runs after the DAG is built. Every problem found is collected into a
//! [`ValidationResult`]; nothing here returns `Err`.

use serde::{Deserialize, Serialize};
use swdl_types::workflow::{ContractType, StageDefinition, WorkflowDefinition};

use super::dag::Dag;
use super::expression::parser::{Expr, PathSegment, PropertyPath};
use super::expression::{extract_expressions, has_placeholder, parse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Expression,
    Dag,
    Parameter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub category: IssueCategory,
    pub severity: Severity,
    pub stage_id: String,
    /// Location inside the stage, e.g. `inputs.topic.source`.
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    fn push(&mut self, issue: ValidationIssue) {
        match issue.severity {
            Severity::Error => self.errors.push(issue),
            Severity::Warning => self.warnings.push(issue),
        }
    }
}

const NON_RETRYABLE_FIELD: &str = "error_policy.retry.non_retryable_errors";

/// Check every expression-bearing field of every stage.
pub fn validate_expressions(def: &WorkflowDefinition, dag: &Dag) -> ValidationResult {
    let mut result = ValidationResult::default();

    for stage in &def.stages {
        let mut check = StageCheck {
            def,
            dag,
            stage,
            result: &mut result,
        };

        for (name, input) in &stage.inputs {
            let field = format!("inputs.{name}.source");
            for body in extract_expressions(&input.source) {
                check.body(&body, &field, Some(input.input_type));
            }
        }

        if let Some(condition) = &stage.condition {
            let bodies = if has_placeholder(condition) {
                extract_expressions(condition)
            } else {
                vec![condition.trim().to_string()]
            };
            for body in bodies {
                check.body(&body, "condition", None);
            }
        }

        let non_retryable = stage
            .error_policy
            .as_ref()
            .and_then(|p| p.retry.as_ref())
            .map(|r| r.non_retryable_errors.as_slice())
            .unwrap_or_default();
        for entry in non_retryable.iter().filter(|e| has_placeholder(e)) {
            for body in extract_expressions(entry) {
                check.body(&body, NON_RETRYABLE_FIELD, None);
            }
        }
    }

    result.valid = result.errors.is_empty();
    tracing::debug!(
        workflow = %def.name,
        errors = result.errors.len(),
        warnings = result.warnings.len(),
        "expression validation finished"
    );
    result
}

struct StageCheck<'a> {
    def: &'a WorkflowDefinition,
    dag: &'a Dag,
    stage: &'a StageDefinition,
    result: &'a mut ValidationResult,
}

impl StageCheck<'_> {
    fn issue(&mut self, category: IssueCategory, severity: Severity, field: &str, message: String) {
        self.result.push(ValidationIssue {
            category,
            severity,
            stage_id: self.stage.id.clone(),
            field: field.to_string(),
            message,
        });
    }

    fn body(&mut self, body: &str, field: &str, input_type: Option<ContractType>) {
        let expr = match parse(body) {
            Ok(expr) => expr,
            Err(e) => {
                self.issue(
                    IssueCategory::Expression,
                    Severity::Error,
                    field,
                    format!("invalid expression '{body}': {e}"),
                );
                return;
            }
        };

        let mut paths = Vec::new();
        collect_paths(&expr, &mut paths);
        // Type compatibility only applies when the input is exactly one reference.
        let sole_reference = matches!(expr, Expr::Path(_));

        for path in paths {
            match path.root.as_str() {
                "stages" => self.stage_reference(path, field, input_type.filter(|_| sole_reference)),
                "parameters" => self.parameter_reference(path, field),
                _ => {}
            }
        }
    }

    fn stage_reference(
        &mut self,
        path: &PropertyPath,
        field: &str,
        input_type: Option<ContractType>,
    ) {
        let Some(PathSegment::Key(target_id)) = path.segments.first() else {
            return;
        };
        let Ok(target) = self.dag.get_stage(target_id) else {
            self.issue(
                IssueCategory::Expression,
                Severity::Error,
                field,
                format!("references unknown stage '{target_id}'"),
            );
            return;
        };

        let Some(PathSegment::Key(kind)) = path.segments.get(1) else {
            return;
        };
        if kind != "outputs" {
            return;
        }

        let is_self = target_id == &self.stage.id;
        if !is_self && !self.stage.depends_on.iter().any(|d| d == target_id) {
            self.issue(
                IssueCategory::Dag,
                Severity::Error,
                field,
                format!(
                    "reads outputs of stage '{target_id}' but does not list it in depends_on"
                ),
            );
        }

        let Some(PathSegment::Key(key)) = path.segments.get(2) else {
            return;
        };
        let Some(output) = target.outputs.get(key) else {
            let declared: Vec<&str> = target.outputs.keys().map(String::as_str).collect();
            let declared = if declared.is_empty() {
                "none".to_string()
            } else {
                declared.join(", ")
            };
            self.issue(
                IssueCategory::Expression,
                Severity::Error,
                field,
                format!(
                    "stage '{target_id}' has no output '{key}' (declared: {declared})"
                ),
            );
            return;
        };

        if let Some(expected) = input_type {
            if !types_compatible(expected, output.output_type) {
                self.issue(
                    IssueCategory::Expression,
                    Severity::Warning,
                    field,
                    format!(
                        "input expects {expected} but stages.{target_id}.outputs.{key} is declared as {}",
                        output.output_type
                    ),
                );
            }
        }
    }

    fn parameter_reference(&mut self, path: &PropertyPath, field: &str) {
        let Some(PathSegment::Key(name)) = path.segments.first() else {
            return;
        };
        if !self.def.config.parameters.contains_key(name) {
            self.issue(
                IssueCategory::Expression,
                Severity::Error,
                field,
                format!("references undeclared parameter '{name}'"),
            );
        }
    }
}

fn types_compatible(input: ContractType, output: ContractType) -> bool {
    input == output
        || input == ContractType::Any
        || output == ContractType::Any
        || (input == ContractType::Number && output == ContractType::Integer)
}

fn collect_paths<'e>(expr: &'e Expr, out: &mut Vec<&'e PropertyPath>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Path(path) => out.push(path),
        Expr::Call { args, .. } => args.iter().for_each(|a| collect_paths(a, out)),
        Expr::Not(inner) => collect_paths(inner, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_paths(lhs, out);
            collect_paths(rhs, out);
        }
        Expr::Ternary {
            condition,
            then_branch,
            else_branch,
        } => {
            collect_paths(condition, out);
            collect_paths(then_branch, out);
            collect_paths(else_branch, out);
        }
    }
}
