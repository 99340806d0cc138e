//! Definitions shared by the CLI and HTTP tests.

use swdl_core::workflow::definition::{SourceFormat, parse_workflow_str};
use swdl_types::workflow::WorkflowDefinition;

/// Two agent stages, the second consuming the first's output.
pub const SAMPLE_YAML: &str = r#"
id: sample
name: Sample
version: "1.0.0"
config:
  parameters:
    topic:
      type: string
      default: rust
stages:
  - id: draft
    name: Draft
    roles:
      primary: agent:writer
    inputs:
      topic:
        type: string
        source: "${{ parameters.topic }}"
    outputs:
      summary:
        type: string
  - id: publish
    name: Publish
    depends_on: [draft]
    roles:
      primary: agent:publisher
    inputs:
      text:
        type: string
        source: "${{ stages.draft.outputs.summary }}"
"#;

/// An agent stage behind an approval gate.
pub const GATED_YAML: &str = r#"
id: gated
name: Gated
version: "1.0.0"
stages:
  - id: review
    name: Review
    type: gate
    gate:
      approvers: [lead]
      timeout: 1h
  - id: ship
    name: Ship
    depends_on: [review]
    roles:
      primary: agent:shipper
"#;

pub fn sample_definition(id: &str) -> WorkflowDefinition {
    let mut def = parse_workflow_str(SAMPLE_YAML, SourceFormat::Yaml).unwrap();
    def.id = id.to_string();
    def
}

pub fn gated_definition() -> WorkflowDefinition {
    parse_workflow_str(GATED_YAML, SourceFormat::Yaml).unwrap()
}
