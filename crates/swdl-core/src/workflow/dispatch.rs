//! Boundary between the execution engine and whatever runs a stage.
//!
//! The engine resolves inputs and hands a [`StageRequest`] to a
//! [`StageDispatcher`]. What comes back is packaged according to the stage's
//! handoff configuration before it is stored as the step output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use swdl_types::workflow::{ContractType, HandoffConfig, HandoffFormat, StageType};
use uuid::Uuid;

/// Error label used when a dispatch exceeds the stage timeout.
pub const TIMEOUT_LABEL: &str = "timeout";

/// Error label used when a dispatcher omits a required declared output.
pub const MISSING_OUTPUT_LABEL: &str = "missing_output";

/// Everything a dispatcher needs to run one attempt of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub stage_id: String,
    pub stage_name: String,
    pub stage_type: StageType,
    /// 1-based.
    pub attempt: u32,
    /// Primary artifact reference, e.g. `agent:researcher`.
    pub primary: Option<String>,
    pub model: Option<String>,
    pub instructions: Option<String>,
    pub tools: Vec<String>,
    /// Resolved input values keyed by input name.
    pub inputs: Map<String, Value>,
    /// Declared output names and types.
    pub outputs: BTreeMap<String, ContractType>,
    pub context_modules: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Raw outputs returned by a dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub outputs: Map<String, Value>,
}

impl StageResult {
    pub fn new(outputs: Map<String, Value>) -> Self {
        Self { outputs }
    }
}

/// A failed dispatch attempt. `label` is matched against
/// `non_retryable_errors`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{label}: {message}")]
pub struct DispatchError {
    pub label: String,
    pub message: String,
}

impl DispatchError {
    pub fn new(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            message: message.into(),
        }
    }

    pub fn timeout(after: &str) -> Self {
        Self::new(TIMEOUT_LABEL, format!("stage timed out after {after}"))
    }
}

/// Runs a single stage attempt.
///
/// Uses RPITIT so implementations can be plain `async fn`s.
pub trait StageDispatcher: Send + Sync + 'static {
    fn dispatch(
        &self,
        request: StageRequest,
    ) -> impl std::future::Future<Output = Result<StageResult, DispatchError>> + Send;
}

// ---------------------------------------------------------------------------
// EchoDispatcher
// ---------------------------------------------------------------------------

/// Dispatcher that performs no work: it echoes the resolved inputs back and
/// fills every declared output, so whole workflows can be exercised offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoDispatcher;

impl StageDispatcher for EchoDispatcher {
    async fn dispatch(&self, request: StageRequest) -> Result<StageResult, DispatchError> {
        tracing::debug!(
            execution_id = %request.execution_id,
            stage_id = %request.stage_id,
            attempt = request.attempt,
            "echo dispatch"
        );
        let mut outputs = request.inputs.clone();
        for (name, ty) in &request.outputs {
            if !outputs.contains_key(name) {
                outputs.insert(name.clone(), placeholder_for(*ty, &request.stage_id, name));
            }
        }
        Ok(StageResult::new(outputs))
    }
}

fn placeholder_for(ty: ContractType, stage_id: &str, name: &str) -> Value {
    match ty {
        ContractType::String | ContractType::Any => Value::String(format!("{stage_id}.{name}")),
        ContractType::Number | ContractType::Integer => json!(0),
        ContractType::Boolean => Value::Bool(false),
        ContractType::Array => Value::Array(Vec::new()),
        ContractType::Object => Value::Object(Map::new()),
    }
}

// ---------------------------------------------------------------------------
// Handoff packaging
// ---------------------------------------------------------------------------

/// Shape raw dispatcher outputs into the stored step output.
///
/// - `structured`: outputs as returned; every required declared output must
///   be present.
/// - `markdown`: same check, with non-string values rendered as fenced JSON.
/// - `raw`: passed through untouched.
///
/// With `include_metadata`, a `_metadata` object records the stage id,
/// attempt and format.
pub fn package_output(
    handoff: &HandoffConfig,
    required: &[&str],
    stage_id: &str,
    attempt: u32,
    result: StageResult,
) -> Result<Value, DispatchError> {
    let mut outputs = result.outputs;

    if handoff.format != HandoffFormat::Raw {
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| !outputs.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(DispatchError::new(
                MISSING_OUTPUT_LABEL,
                format!("missing required output(s): {}", missing.join(", ")),
            ));
        }
    }

    if handoff.format == HandoffFormat::Markdown {
        for value in outputs.values_mut() {
            if !value.is_string() {
                let pretty = serde_json::to_string_pretty(value).unwrap_or_default();
                *value = Value::String(format!("```json\n{pretty}\n```"));
            }
        }
    }

    if handoff.include_metadata {
        let format = serde_json::to_value(handoff.format).unwrap_or(Value::Null);
        outputs.insert(
            "_metadata".to_string(),
            json!({ "stage_id": stage_id, "attempt": attempt, "format": format }),
        );
    }

    Ok(Value::Object(outputs))
}
