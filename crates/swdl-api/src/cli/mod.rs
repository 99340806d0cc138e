//! CLI command definitions and dispatch for the `swdl` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! noun (`swdl workflow plan`, `swdl execution approve`) with `run` and
//! `serve` at the top level.

pub mod execution;
pub mod render;
pub mod workflow;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use swdl_core::workflow::definition::load_workflow_file;
use swdl_types::workflow::WorkflowDefinition;

use crate::state::AppState;

/// Plan, run and inspect multi-stage agent workflows.
#[derive(Parser)]
#[command(name = "swdl", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Keep everything in memory for this invocation instead of the database.
    #[arg(long, global = true)]
    pub ephemeral: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate, plan and manage workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Start a workflow from a file or stored id and run it to completion
    /// or the first waiting gate.
    Run {
        /// Path to a YAML/JSON definition, or the id of a stored workflow.
        target: String,

        /// Parameter value as key=value (JSON values are parsed; repeatable).
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Replace the workflow timeout for this run (e.g. "30m").
        #[arg(long)]
        timeout: Option<String>,
    },

    /// Inspect and control executions.
    #[command(alias = "exec")]
    Execution {
        #[command(subcommand)]
        action: execution::ExecutionCommand,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on (defaults to config.toml's server.port).
        #[arg(long, env = "SWDL_PORT")]
        port: Option<u16>,

        /// Host to bind to (defaults to config.toml's server.host).
        #[arg(long, env = "SWDL_HOST")]
        host: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse repeated `key=value` flags. Values that parse as JSON keep their
/// type (`count=3`, `flags=["a"]`); anything else is taken as a string.
pub fn parse_params(raw: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut params = BTreeMap::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid parameter '{entry}': expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid parameter '{entry}': empty key");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

/// Where a `<file|id>` argument came from.
pub enum Target {
    File(WorkflowDefinition),
    Stored(WorkflowDefinition),
}

impl Target {
    pub fn definition(&self) -> &WorkflowDefinition {
        match self {
            Target::File(def) | Target::Stored(def) => def,
        }
    }
}

/// Resolve a `<file|id>` argument: an existing path is loaded from disk,
/// anything else is looked up as a stored workflow id.
pub async fn resolve_target(state: &AppState, target: &str) -> Result<Target> {
    let path = Path::new(target);
    if path.is_file() {
        let def = load_workflow_file(path)
            .with_context(|| format!("Failed to load workflow file '{target}'"))?;
        return Ok(Target::File(def));
    }

    let def = state
        .workflow_service
        .get_workflow(target)
        .await
        .with_context(|| format!("'{target}' is neither a workflow file nor a stored workflow id"))?;
    Ok(Target::Stored(def))
}

/// Parse an execution id argument.
pub fn parse_execution_id(raw: &str) -> Result<uuid::Uuid> {
    raw.parse()
        .with_context(|| format!("Invalid execution ID: '{raw}'"))
}
