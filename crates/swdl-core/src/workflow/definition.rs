//! Workflow definition parsing, structural validation, and filesystem operations.
//!
//! Converts YAML or JSON source into the `WorkflowDefinition` value type,
//! validates structural constraints (unique ids, stage type pairing, contract
//! types, durations, retry bounds, artifact references), and provides
//! discovery for workflow files on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use swdl_types::error::RepositoryError;
use swdl_types::execution::ExecutionStatus;
use swdl_types::workflow::{RetryPolicy, StageType, WorkflowDefinition};
use thiserror::Error;
use uuid::Uuid;

use super::duration::{MAX_DURATION, format_duration, parse_duration};
use super::expression::ExpressionError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during workflow operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Malformed source or schema violation, with every field-level problem.
    #[error("failed to parse {path}: {}", .messages.join("; "))]
    Parse { path: String, messages: Vec<String> },

    /// Semantically invalid definition or parameters.
    #[error("validation error: {0}")]
    Validation(String),

    /// Dependency graph contains a loop. `path` closes on its first id.
    #[error("cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// A role references an artifact that cannot be resolved.
    #[error("stage '{stage_id}' has invalid artifact reference '{reference}': {reason}")]
    ArtifactReference {
        stage_id: String,
        reference: String,
        reason: String,
    },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("stage '{0}' not found")]
    StageNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Lifecycle operation not allowed in the current status.
    #[error("cannot {operation} execution {id} while {status}")]
    InvalidState {
        id: Uuid,
        status: ExecutionStatus,
        operation: &'static str,
    },

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    pub fn workflow_not_found(id: impl Into<String>) -> Self {
        WorkflowError::NotFound {
            kind: "workflow",
            id: id.into(),
        }
    }

    pub fn execution_not_found(id: &Uuid) -> Self {
        WorkflowError::NotFound {
            kind: "execution",
            id: id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Source encoding of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Yaml,
    Json,
}

impl SourceFormat {
    /// Pick a format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Some(SourceFormat::Yaml),
            Some("json") => Some(SourceFormat::Json),
            _ => None,
        }
    }
}

/// Parse workflow source, choosing the format from `path`'s extension.
pub fn parse_workflow(source: &str, path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let label = path.display().to_string();
    let format = SourceFormat::from_path(path).ok_or_else(|| WorkflowError::Parse {
        path: label.clone(),
        messages: vec!["unsupported file extension (expected .yaml, .yml or .json)".to_string()],
    })?;
    parse_with_label(source, format, &label)
}

/// Parse in-memory workflow source of a known format.
pub fn parse_workflow_str(
    source: &str,
    format: SourceFormat,
) -> Result<WorkflowDefinition, WorkflowError> {
    parse_with_label(source, format, "<inline>")
}

fn parse_with_label(
    source: &str,
    format: SourceFormat,
    label: &str,
) -> Result<WorkflowDefinition, WorkflowError> {
    let parsed: Result<WorkflowDefinition, String> = match format {
        SourceFormat::Yaml => serde_yaml_ng::from_str(source).map_err(|e| e.to_string()),
        SourceFormat::Json => serde_json::from_str(source).map_err(|e| e.to_string()),
    };
    let mut def = parsed.map_err(|message| WorkflowError::Parse {
        path: label.to_string(),
        messages: vec![message],
    })?;

    if def.id.trim().is_empty() {
        def.id = Uuid::now_v7().to_string();
    }

    let messages = structural_issues(&def);
    if !messages.is_empty() {
        return Err(WorkflowError::Parse {
            path: label.to_string(),
            messages,
        });
    }
    check_artifact_references(&def)?;

    tracing::debug!(workflow_id = %def.id, stages = def.stages.len(), "parsed workflow definition");
    Ok(def)
}

/// Serialize a definition to YAML.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::Parse {
        path: def.id.clone(),
        messages: vec![e.to_string()],
    })
}

// ---------------------------------------------------------------------------
// Structural validation
// ---------------------------------------------------------------------------

/// Structural checks followed by artifact reference syntax.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let messages = structural_issues(def);
    if !messages.is_empty() {
        return Err(WorkflowError::Parse {
            path: def.id.clone(),
            messages,
        });
    }
    check_artifact_references(def)
}

/// Collect every structural problem as `field: message` strings.
///
/// Dependency targets are not checked here; the DAG builder reports those.
pub fn structural_issues(def: &WorkflowDefinition) -> Vec<String> {
    let mut issues = Vec::new();

    if def.name.trim().is_empty() {
        issues.push("name: must not be empty".to_string());
    }
    if parse_version(&def.version).is_none() {
        issues.push(format!("version: '{}' is not a semantic version", def.version));
    }
    duration_issue("config.timeout", &def.config.timeout, &mut issues);
    if def.stages.is_empty() {
        issues.push("stages: workflow must have at least one stage".to_string());
    }
    if let Some(policy) = def.error_policy.as_ref().and_then(|p| p.default_retry.as_ref()) {
        retry_issues("error_policy.default_retry", policy, &mut issues);
    }

    let mut seen = HashSet::new();
    for (idx, stage) in def.stages.iter().enumerate() {
        let at = format!("stages[{idx}]");

        if stage.id.is_empty() {
            issues.push(format!("{at}.id: must not be empty"));
        } else if !stage
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            issues.push(format!(
                "{at}.id: '{}' may only contain letters, digits, '-' and '_'",
                stage.id
            ));
        }
        if !seen.insert(stage.id.as_str()) {
            issues.push(format!("{at}.id: duplicate stage id '{}'", stage.id));
        }

        let mut deps = HashSet::new();
        for dep in &stage.depends_on {
            if !deps.insert(dep.as_str()) {
                issues.push(format!("{at}.depends_on: '{dep}' listed more than once"));
            }
        }

        match stage.stage_type {
            StageType::Agent | StageType::FanOut => {
                if stage.roles.is_none() {
                    issues.push(format!("{at}.roles: required for {} stages", stage.stage_type));
                }
                if stage.gate.is_some() {
                    issues.push(format!("{at}.gate: only allowed on gate stages"));
                }
            }
            StageType::Gate => {
                if stage.roles.is_some() {
                    issues.push(format!("{at}.roles: not allowed on gate stages"));
                }
            }
        }

        if let Some(gate) = &stage.gate {
            duration_issue(&format!("{at}.gate.timeout"), &gate.timeout, &mut issues);
        }

        if let Some(policy) = &stage.error_policy {
            if let Some(timeout) = &policy.timeout {
                duration_issue(&format!("{at}.error_policy.timeout"), timeout, &mut issues);
            }
            if let Some(retry) = &policy.retry {
                retry_issues(&format!("{at}.error_policy.retry"), retry, &mut issues);
            }
        }
    }

    issues
}

fn retry_issues(at: &str, retry: &RetryPolicy, issues: &mut Vec<String>) {
    if retry.max_attempts < 1 {
        issues.push(format!("{at}.max_attempts: must be at least 1"));
    }
    if !(retry.backoff_multiplier >= 1.0) {
        issues.push(format!("{at}.backoff_multiplier: must be >= 1.0"));
    }
    for (field, value) in [
        ("initial_interval", &retry.initial_interval),
        ("max_interval", &retry.max_interval),
    ] {
        duration_issue(&format!("{at}.{field}"), value, issues);
    }
}

fn duration_issue(field: &str, value: &str, issues: &mut Vec<String>) {
    match parse_duration(value) {
        None => issues.push(format!("{field}: invalid duration '{value}'")),
        Some(d) if d > MAX_DURATION => issues.push(format!(
            "{field}: '{value}' exceeds the maximum of {}",
            format_duration(MAX_DURATION.as_secs())
        )),
        Some(_) => {}
    }
}

/// Accepts full semver and the `MAJOR.MINOR` shorthand.
fn parse_version(version: &str) -> Option<semver::Version> {
    semver::Version::parse(version)
        .or_else(|_| semver::Version::parse(&format!("{version}.0")))
        .ok()
}

/// Artifact kinds a role may reference.
pub const ARTIFACT_KINDS: &[&str] = &["agent", "skill", "command", "mcp", "hook"];

/// Role references must be `<kind>:<name>` with a known kind.
fn check_artifact_references(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    for stage in &def.stages {
        let Some(roles) = &stage.roles else {
            continue;
        };
        let invalid = |reason: String| WorkflowError::ArtifactReference {
            stage_id: stage.id.clone(),
            reference: roles.primary.clone(),
            reason,
        };
        let Some((kind, name)) = roles.primary.split_once(':') else {
            return Err(invalid("expected '<kind>:<name>'".to_string()));
        };
        if !ARTIFACT_KINDS.contains(&kind) {
            return Err(invalid(format!(
                "unknown artifact kind '{kind}' (expected one of {})",
                ARTIFACT_KINDS.join(", ")
            )));
        }
        if name.trim().is_empty() {
            return Err(invalid("artifact name is empty".to_string()));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a `.yaml`, `.yml` or `.json` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content, path)
}

/// Save a workflow definition, encoding by the path's extension.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = match SourceFormat::from_path(path) {
        Some(SourceFormat::Json) => {
            serde_json::to_string_pretty(def).map_err(|e| WorkflowError::Parse {
                path: path.display().to_string(),
                messages: vec![e.to_string()],
            })?
        }
        _ => serialize_workflow_yaml(def)?,
    };
    std::fs::write(path, content)?;
    Ok(())
}

/// Discover all workflow files under `base_dir`.
///
/// Files that fail to parse are logged and skipped.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if SourceFormat::from_path(&path).is_some() {
            match load_workflow_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable workflow file"),
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{agent_stage, workflow};

    const YAML: &str = r#"
id: digest
name: Daily Digest
version: "1.0"
stages:
  - id: gather
    name: Gather
    roles:
      primary: agent:researcher
    outputs:
      summary:
        type: string
  - id: approve
    name: Approve
    type: gate
    depends_on: [gather]
"#;

    #[test]
    fn test_parse_yaml() {
        let def = parse_workflow(YAML, Path::new("digest.yaml")).expect("should parse");
        assert_eq!(def.id, "digest");
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.stages[0].stage_type, StageType::Agent);
        assert_eq!(def.stages[1].stage_type, StageType::Gate);
    }

    #[test]
    fn test_parse_json_by_extension() {
        let def = parse_workflow(YAML, Path::new("digest.yaml")).unwrap();
        let json = serde_json::to_string(&def).unwrap();
        let parsed = parse_workflow(&json, Path::new("digest.json")).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn test_unsupported_extension() {
        let err = parse_workflow(YAML, Path::new("digest.toml")).unwrap_err();
        match err {
            WorkflowError::Parse { path, messages } => {
                assert_eq!(path, "digest.toml");
                assert!(messages[0].contains("unsupported file extension"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_syntax_error_carries_path() {
        let err = parse_workflow("stages: [", Path::new("broken.yml")).unwrap_err();
        assert!(matches!(err, WorkflowError::Parse { ref path, .. } if path == "broken.yml"));
    }

    #[test]
    fn test_generates_missing_id() {
        let src = r#"{"name": "x", "stages": [{"id": "a", "name": "A", "roles": {"primary": "agent:a"}}]}"#;
        let def = parse_workflow_str(src, SourceFormat::Json).unwrap();
        assert!(Uuid::parse_str(&def.id).is_ok());
    }

    #[test]
    fn test_structural_issues_are_all_reported() {
        let mut def = workflow(vec![
            agent_stage("a", &[]),
            agent_stage("a", &[]),
            agent_stage("bad id", &[]),
        ]);
        def.stages[0].roles = None;
        def.config.timeout = "forever".to_string();

        let issues = structural_issues(&def);
        assert!(issues.iter().any(|m| m == "stages[0].roles: required for agent stages"));
        assert!(issues.iter().any(|m| m.contains("duplicate stage id 'a'")));
        assert!(issues.iter().any(|m| m.starts_with("stages[2].id")));
        assert!(issues.iter().any(|m| m.starts_with("config.timeout")));
        assert_eq!(issues.len(), 4);
    }

    #[test]
    fn test_gate_with_roles_rejected() {
        let mut def = workflow(vec![agent_stage("a", &[])]);
        def.stages[0].stage_type = StageType::Gate;
        let issues = structural_issues(&def);
        assert_eq!(issues, vec!["stages[0].roles: not allowed on gate stages"]);
    }

    #[test]
    fn test_retry_bounds() {
        let mut def = workflow(vec![agent_stage("a", &[])]);
        def.stages[0].error_policy = Some(swdl_types::workflow::ErrorPolicy {
            retry: Some(RetryPolicy {
                max_attempts: 0,
                backoff_multiplier: 0.5,
                initial_interval: "soon".to_string(),
                ..RetryPolicy::default()
            }),
            ..Default::default()
        });
        let issues = structural_issues(&def);
        assert_eq!(issues.len(), 3, "got: {issues:?}");
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let def = workflow(vec![]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("at least one stage"));
    }

    #[test]
    fn test_artifact_reference_checked() {
        let mut def = workflow(vec![agent_stage("a", &[])]);
        def.stages[0].roles.as_mut().unwrap().primary = "widget:thing".to_string();
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::ArtifactReference { ref stage_id, .. } if stage_id == "a"
        ));

        def.stages[0].roles.as_mut().unwrap().primary = "researcher".to_string();
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::ArtifactReference { .. })
        ));
    }

    #[test]
    fn test_cycle_error_display() {
        let err = WorkflowError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cycle detected: a -> b -> a");
    }

    #[test]
    fn test_save_and_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let def = workflow(vec![agent_stage("a", &[])]);

        for name in ["wf/test.yaml", "wf/test.json"] {
            let path = dir.path().join(name);
            save_workflow_file(&path, &def).expect("should save");
            let loaded = load_workflow_file(&path).expect("should load");
            assert_eq!(loaded, def);
        }
    }

    #[test]
    fn test_discover_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(vec![agent_stage("a", &[])]);

        save_workflow_file(&dir.path().join("one.yaml"), &wf).unwrap();
        save_workflow_file(&dir.path().join("sub/two.json"), &wf).unwrap();
        std::fs::write(dir.path().join("not-a-workflow.yaml"), "key: value").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_workflows(dir.path()).expect("should discover");
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let result = discover_workflows(Path::new("/nonexistent/path"));
        assert!(result.unwrap().is_empty());
    }

    #[test]
    fn test_durations_beyond_a_year_are_rejected() {
        use crate::workflow::testing::gate_stage;
        use swdl_types::workflow::GateConfig;

        let mut gate = gate_stage("review", &[]);
        gate.gate = Some(GateConfig {
            timeout: "100000000d".to_string(),
            ..GateConfig::default()
        });
        let mut def = workflow(vec![gate]);
        def.config.timeout = "366d".to_string();

        let messages = match validate_definition(&def) {
            Err(WorkflowError::Parse { messages, .. }) => messages,
            other => panic!("expected parse error, got {other:?}"),
        };
        assert!(messages.iter().any(|m| m.starts_with("stages[0].gate.timeout") && m.contains("maximum")));
        assert!(messages.iter().any(|m| m.starts_with("config.timeout") && m.contains("maximum")));

        def.config.timeout = "365d".to_string();
        def.stages[0].gate.as_mut().unwrap().timeout = "30d".to_string();
        assert!(validate_definition(&def).is_ok());
    }
}
