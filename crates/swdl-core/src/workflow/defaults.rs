//! Cross-field default resolution.
//!
//! Serde field defaults fill in values that depend only on their own field.
//! `apply_defaults` handles the rest: stage timeouts that depend on the stage
//! type, retry policies inherited from the global error policy, handoff and
//! gate configuration. It only fills absent fields, so applying it twice is
//! the same as applying it once.

use swdl_types::workflow::{
    DEFAULT_AGENT_TIMEOUT, DEFAULT_GATE_TIMEOUT, DEFAULT_WORKFLOW_TIMEOUT, ErrorPolicy,
    GateConfig, HandoffConfig, RetryPolicy, StageDefinition, StageType, WorkflowConfig,
    WorkflowDefinition,
};

/// Return a copy of `def` with every derivable default filled in.
pub fn apply_defaults(def: &WorkflowDefinition) -> WorkflowDefinition {
    let global = def.error_policy.clone().unwrap_or_default();
    let inherited_retry = global.default_retry.clone().unwrap_or_default();
    let on_failure = global.on_stage_failure.to_on_failure();

    let config = if def.config.timeout.trim().is_empty() {
        WorkflowConfig {
            timeout: DEFAULT_WORKFLOW_TIMEOUT.to_string(),
            ..def.config.clone()
        }
    } else {
        def.config.clone()
    };

    let stages = def
        .stages
        .iter()
        .map(|stage| {
            let type_timeout = stage_type_timeout(stage.stage_type);
            let error_policy = match &stage.error_policy {
                None => ErrorPolicy {
                    retry: Some(inherited_retry.clone()),
                    on_failure,
                    timeout: Some(type_timeout.to_string()),
                },
                Some(existing) => ErrorPolicy {
                    retry: existing
                        .retry
                        .clone()
                        .or_else(|| Some(inherited_retry.clone())),
                    on_failure: existing.on_failure,
                    timeout: existing
                        .timeout
                        .clone()
                        .or_else(|| Some(type_timeout.to_string())),
                },
            };

            let gate = match (stage.stage_type, &stage.gate) {
                (StageType::Gate, None) => Some(GateConfig::default()),
                (_, gate) => gate.clone(),
            };

            StageDefinition {
                error_policy: Some(error_policy),
                handoff: Some(stage.handoff.clone().unwrap_or_default()),
                gate,
                ..stage.clone()
            }
        })
        .collect();

    WorkflowDefinition {
        config,
        stages,
        ..def.clone()
    }
}

/// Timeout used for a stage type when the stage declares none.
pub fn stage_type_timeout(stage_type: StageType) -> &'static str {
    match stage_type {
        StageType::Agent | StageType::FanOut => DEFAULT_AGENT_TIMEOUT,
        StageType::Gate => DEFAULT_GATE_TIMEOUT,
    }
}

/// Effective retry policy of a (defaulted or raw) stage.
pub fn effective_retry(stage: &StageDefinition) -> RetryPolicy {
    stage
        .error_policy
        .as_ref()
        .and_then(|p| p.retry.clone())
        .unwrap_or_default()
}

/// Effective timeout string of a (defaulted or raw) stage.
pub fn effective_timeout(stage: &StageDefinition) -> String {
    stage
        .error_policy
        .as_ref()
        .and_then(|p| p.timeout.clone())
        .unwrap_or_else(|| stage_type_timeout(stage.stage_type).to_string())
}

/// Effective handoff of a (defaulted or raw) stage.
pub fn effective_handoff(stage: &StageDefinition) -> HandoffConfig {
    stage.handoff.clone().unwrap_or_default()
}
