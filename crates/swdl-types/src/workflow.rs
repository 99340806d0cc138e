//! Workflow definition types for SWDL.
//!
//! A `WorkflowDefinition` is the parsed form of a YAML or JSON workflow file.
//! Every struct here is a plain value object: the engine in `swdl-core`
//! reconstructs them wholesale rather than mutating them in place.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Static default for the workflow-level timeout.
pub const DEFAULT_WORKFLOW_TIMEOUT: &str = "2h";
/// Timeout assigned to agent and fan-out stages that declare none.
pub const DEFAULT_AGENT_TIMEOUT: &str = "30m";
/// Timeout assigned to gate stages that declare none.
pub const DEFAULT_GATE_TIMEOUT: &str = "24h";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    /// Workflow identifier. Generated on parse when the source omits it.
    #[serde(default)]
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Declared parameters, global timeout and environment.
    #[serde(default)]
    pub config: WorkflowConfig,
    /// Global context bindings visible to every stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextConfig>,
    /// Stages in declaration order. This order breaks every tie.
    pub stages: Vec<StageDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<GlobalErrorPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a stage by id.
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }
}

/// Global workflow configuration block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterSpec>,
    /// Wall-clock bound for a whole execution.
    #[serde(default = "default_workflow_timeout")]
    pub timeout: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

fn default_workflow_timeout() -> String {
    DEFAULT_WORKFLOW_TIMEOUT.to_string()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            parameters: BTreeMap::new(),
            timeout: default_workflow_timeout(),
            env: BTreeMap::new(),
        }
    }
}

/// A declared workflow parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParameterSpec {
    #[serde(rename = "type", default)]
    pub param_type: ContractType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Global context bindings: named context modules plus free-form values
/// exposed under the `context` expression namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContextConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Lifecycle hooks. Hook commands are recorded in the event log, not run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_start: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<String>,
}

// ---------------------------------------------------------------------------
// Stage Definition
// ---------------------------------------------------------------------------

/// A single stage (graph node) of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageDefinition {
    /// Unique within a workflow.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Stage ids this stage waits on. A set, kept in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(rename = "type", default)]
    pub stage_type: StageType,
    /// Role assignment. Required for agent and fan-out stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<RoleAssignment>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputContract>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputContract>,
    /// `${{ }}` expression; the stage is skipped when it evaluates falsy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Context module references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<ErrorPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<HandoffConfig>,
    /// Gate configuration. Only valid on gate stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateConfig>,
}

/// Discriminator for stage behavior.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    #[default]
    Agent,
    Gate,
    FanOut,
}

impl StageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageType::Agent => "agent",
            StageType::Gate => "gate",
            StageType::FanOut => "fan_out",
        }
    }

    /// Agent and fan-out stages do work through the dispatcher.
    pub fn is_dispatched(&self) -> bool {
        !matches!(self, StageType::Gate)
    }
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which artifact performs a stage, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoleAssignment {
    /// Primary artifact reference, `<kind>:<name>` (e.g. `agent:researcher`).
    pub primary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

/// Value type vocabulary shared by parameters and stage contracts.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::String => "string",
            ContractType::Number => "number",
            ContractType::Integer => "integer",
            ContractType::Boolean => "boolean",
            ContractType::Array => "array",
            ContractType::Object => "object",
            ContractType::Any => "any",
        }
    }
}

impl std::fmt::Display for ContractType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named stage input bound to an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InputContract {
    #[serde(rename = "type", default)]
    pub input_type: ContractType,
    /// Template containing zero or more `${{ }}` placeholders.
    pub source: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A named stage output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputContract {
    #[serde(rename = "type", default)]
    pub output_type: ContractType,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Error policies
// ---------------------------------------------------------------------------

/// Retry behavior for a failing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval")]
    pub initial_interval: String,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_interval")]
    pub max_interval: String,
    /// Dispatch error labels that fail immediately without retry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_retryable_errors: Vec<String>,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_initial_interval() -> String {
    "30s".to_string()
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_interval() -> String {
    "5m".to_string()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval: default_initial_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            max_interval: default_max_interval(),
            non_retryable_errors: Vec::new(),
        }
    }
}

/// What happens to the execution once a stage has failed for good.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Halt,
    Continue,
    SkipDependents,
}

/// Stage-level error policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Workflow-wide failure action.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum StageFailureAction {
    #[default]
    Halt,
    Continue,
    Rollback,
}

impl StageFailureAction {
    /// Stage-level equivalent. Rollback is not executed by the engine and halts.
    pub fn to_on_failure(self) -> OnFailure {
        match self {
            StageFailureAction::Halt | StageFailureAction::Rollback => OnFailure::Halt,
            StageFailureAction::Continue => OnFailure::Continue,
        }
    }
}

/// Global error policy inherited by stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GlobalErrorPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry: Option<RetryPolicy>,
    #[serde(default)]
    pub on_stage_failure: StageFailureAction,
}

// ---------------------------------------------------------------------------
// Gates and handoff
// ---------------------------------------------------------------------------

/// Action taken when a gate is not decided before its deadline.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum GateTimeoutAction {
    #[default]
    Halt,
    AutoApprove,
    Reject,
}

/// Manual approval gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GateConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvers: Vec<String>,
    #[serde(default = "default_gate_timeout")]
    pub timeout: String,
    #[serde(default)]
    pub on_timeout: GateTimeoutAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_gate_timeout() -> String {
    DEFAULT_GATE_TIMEOUT.to_string()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            approvers: Vec::new(),
            timeout: default_gate_timeout(),
            on_timeout: GateTimeoutAction::default(),
            message: None,
        }
    }
}

/// Packaging applied to a stage's outputs before dependents see them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum HandoffFormat {
    #[default]
    Structured,
    Markdown,
    Raw,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HandoffConfig {
    #[serde(default)]
    pub format: HandoffFormat,
    #[serde(default)]
    pub include_metadata: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
id: research-pipeline
name: Research Pipeline
version: 1.2.0
tags: [research]
config:
  parameters:
    topic:
      type: string
      required: true
    depth:
      type: integer
      default: 3
  env:
    REGION: eu
stages:
  - id: research
    name: Research
    type: agent
    roles:
      primary: agent:researcher
      model: sonnet
    inputs:
      topic:
        type: string
        source: "${{ parameters.topic }}"
    outputs:
      summary:
        type: string
  - id: review
    name: Review
    type: gate
    depends_on: [research]
    gate:
      approvers: [lead]
      on_timeout: auto_approve
error_policy:
  on_stage_failure: continue
"#;

    #[test]
    fn test_workflow_definition_yaml_parse() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        assert_eq!(def.id, "research-pipeline");
        assert_eq!(def.version, "1.2.0");
        assert_eq!(def.config.timeout, "2h");
        assert_eq!(def.config.parameters.len(), 2);
        assert!(def.config.parameters["topic"].required);
        assert_eq!(def.config.parameters["depth"].param_type, ContractType::Integer);
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.stages[1].stage_type, StageType::Gate);
        assert_eq!(def.stages[1].depends_on, vec!["research"]);

        let gate = def.stages[1].gate.as_ref().unwrap();
        assert_eq!(gate.timeout, "24h");
        assert_eq!(gate.on_timeout, GateTimeoutAction::AutoApprove);

        let policy = def.error_policy.as_ref().unwrap();
        assert_eq!(policy.on_stage_failure, StageFailureAction::Continue);
        assert!(policy.default_retry.is_none());
    }

    #[test]
    fn test_workflow_definition_json_roundtrip() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        let json = serde_json::to_string_pretty(&def).unwrap();
        assert!(json.contains("\"type\": \"gate\""));
        let parsed: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn test_input_and_output_contract_defaults() {
        let input: InputContract = serde_json::from_str(r#"{"source": "x"}"#).unwrap();
        assert_eq!(input.input_type, ContractType::Any);
        assert!(input.required);

        let output: OutputContract = serde_json::from_str("{}").unwrap();
        assert_eq!(output.output_type, ContractType::Any);
        assert!(output.required);
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.initial_interval, "30s");
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(policy.max_interval, "5m");
    }

    #[test]
    fn test_stage_failure_action_mapping() {
        assert_eq!(StageFailureAction::Halt.to_on_failure(), OnFailure::Halt);
        assert_eq!(StageFailureAction::Continue.to_on_failure(), OnFailure::Continue);
        assert_eq!(StageFailureAction::Rollback.to_on_failure(), OnFailure::Halt);
    }

    #[test]
    fn test_unknown_stage_type_rejected() {
        let result: Result<StageType, _> = serde_json::from_str("\"loop\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_enum_serde_snake_case() {
        assert_eq!(serde_json::to_string(&StageType::FanOut).unwrap(), "\"fan_out\"");
        assert_eq!(
            serde_json::to_string(&OnFailure::SkipDependents).unwrap(),
            "\"skip_dependents\""
        );
        assert_eq!(StageType::FanOut.to_string(), "fan_out");
        assert!(!StageType::Gate.is_dispatched());
    }

    #[test]
    fn test_stage_lookup() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        assert_eq!(def.stage("review").unwrap().name, "Review");
        assert!(def.stage("missing").is_none());
    }
}
