//! Builders shared by the workflow engine's unit tests.

use std::collections::BTreeMap;

use swdl_types::workflow::{
    ContractType, InputContract, OutputContract, ParameterSpec, RoleAssignment, StageDefinition,
    StageType, WorkflowConfig, WorkflowDefinition,
};

pub fn workflow(stages: Vec<StageDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: "test-wf".to_string(),
        name: "Test Workflow".to_string(),
        version: "1.0.0".to_string(),
        description: None,
        tags: Vec::new(),
        config: WorkflowConfig::default(),
        context: None,
        stages,
        error_policy: None,
        hooks: None,
    }
}

pub fn agent_stage(id: &str, deps: &[&str]) -> StageDefinition {
    StageDefinition {
        id: id.to_string(),
        name: id.to_string(),
        description: None,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        stage_type: StageType::Agent,
        roles: Some(RoleAssignment {
            primary: format!("agent:{id}"),
            model: None,
            instructions: None,
            tools: Vec::new(),
        }),
        inputs: BTreeMap::new(),
        outputs: BTreeMap::new(),
        condition: None,
        context: Vec::new(),
        error_policy: None,
        handoff: None,
        gate: None,
    }
}

pub fn gate_stage(id: &str, deps: &[&str]) -> StageDefinition {
    StageDefinition {
        stage_type: StageType::Gate,
        roles: None,
        ..agent_stage(id, deps)
    }
}

pub fn with_input(mut stage: StageDefinition, name: &str, ty: ContractType, source: &str) -> StageDefinition {
    stage.inputs.insert(
        name.to_string(),
        InputContract {
            input_type: ty,
            source: source.to_string(),
            required: true,
            description: None,
        },
    );
    stage
}

pub fn with_output(mut stage: StageDefinition, name: &str, ty: ContractType) -> StageDefinition {
    stage.outputs.insert(
        name.to_string(),
        OutputContract {
            output_type: ty,
            required: true,
            description: None,
        },
    );
    stage
}

pub fn with_param(
    mut def: WorkflowDefinition,
    name: &str,
    required: bool,
    default: Option<serde_json::Value>,
) -> WorkflowDefinition {
    def.config.parameters.insert(
        name.to_string(),
        ParameterSpec {
            param_type: ContractType::Any,
            required,
            default,
            description: None,
        },
    );
    def
}
