//! CLI workflow definition subcommands.
//!
//! Provides validate, plan, create, list, show, delete and schema.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;
use schemars::schema_for;
use serde_json::json;
use swdl_core::service::WorkflowService;
use swdl_core::workflow::definition::{load_workflow_file, serialize_workflow_yaml};
use swdl_core::workflow::planner::generate_plan;
use swdl_types::workflow::WorkflowDefinition;

use super::render::{print_json, print_plan, print_validation};
use super::{Target, parse_params, resolve_target};
use crate::state::{AppState, WorkflowStore};

/// Workflow definition subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Check a definition file: structure, dependency graph and expressions.
    Validate {
        /// Path to a YAML/JSON definition.
        file: PathBuf,
    },

    /// Show the batches a run would execute, without running anything.
    Plan {
        /// Path to a YAML/JSON definition, or the id of a stored workflow.
        target: String,

        /// Parameter value as key=value (repeatable).
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// Store a definition from a file.
    Create {
        /// Path to a YAML/JSON definition.
        file: PathBuf,

        /// Replace an existing workflow with the same id.
        #[arg(long)]
        replace: bool,
    },

    /// List stored workflows.
    #[command(alias = "ls")]
    List,

    /// Print a stored definition as YAML (or JSON with --json).
    Show {
        /// Workflow id.
        id: String,
    },

    /// Delete a stored workflow.
    #[command(alias = "rm")]
    Delete {
        /// Workflow id.
        id: String,

        /// Skip the confirmation prompt.
        #[arg(long, short)]
        yes: bool,
    },

    /// Print the JSON Schema of the definition format.
    Schema,
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Validate { file } => handle_validate(&file, json),
        WorkflowCommand::Plan { target, params } => handle_plan(&target, &params, state, json).await,
        WorkflowCommand::Create { file, replace } => handle_create(&file, replace, state, json).await,
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Show { id } => handle_show(&id, state, json).await,
        WorkflowCommand::Delete { id, yes } => handle_delete(&id, yes, state, json).await,
        WorkflowCommand::Schema => handle_schema(),
    }
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("Failed to load workflow file '{}'", file.display()))?;
    let report = WorkflowService::<WorkflowStore>::validate_workflow(&def)?;

    if json {
        print_json(&report)?;
    } else {
        print_validation(&def.name, &report);
    }

    if !report.valid {
        anyhow::bail!("workflow '{}' failed validation", def.id);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

async fn handle_plan(target: &str, raw_params: &[String], state: &AppState, json: bool) -> Result<()> {
    let params = parse_params(raw_params)?;
    let plan = match resolve_target(state, target).await? {
        Target::File(def) => generate_plan(&def, &params)?,
        Target::Stored(def) => state.workflow_service.plan_workflow(&def.id, &params).await?,
    };

    if json {
        print_json(&plan)?;
    } else {
        print_plan(&plan);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

async fn handle_create(file: &Path, replace: bool, state: &AppState, json: bool) -> Result<()> {
    let def = load_workflow_file(file)
        .with_context(|| format!("Failed to load workflow file '{}'", file.display()))?;

    // Cycles and unknown dependencies surface here rather than at run time.
    let report = WorkflowService::<WorkflowStore>::validate_workflow(&def)?;
    if !report.valid {
        if !json {
            print_validation(&def.name, &report);
        }
        anyhow::bail!("workflow '{}' failed validation", def.id);
    }

    let exists = state.workflow_service.get_workflow(&def.id).await.is_ok();
    let stored = if exists && replace {
        let id = def.id.clone();
        state.workflow_service.update_workflow(&id, def).await?
    } else {
        state.workflow_service.create_workflow(def).await?
    };

    if json {
        print_json(&json!({
            "id": stored.id,
            "name": stored.name,
            "version": stored.version,
            "stages": stored.stages.len(),
            "replaced": exists && replace,
        }))?;
    } else {
        println!();
        println!(
            "  {} {} workflow '{}' ({} stages)",
            style("*").green().bold(),
            if exists && replace { "Replaced" } else { "Created" },
            style(&stored.id).cyan(),
            stored.stages.len()
        );
        println!(
            "  Run it with: {}",
            style(format!("swdl run {}", stored.id)).dim()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// List / Show
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let defs = state.workflow_service.list_workflows().await?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "name": d.name,
                    "version": d.version,
                    "stages": d.stages.len(),
                    "tags": d.tags,
                })
            })
            .collect();
        return print_json(&out);
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows stored.");
        println!(
            "  Create one with: {}",
            style("swdl workflow create <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("Stages"),
            Cell::new("Tags"),
        ]);
    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.id),
            Cell::new(&d.name),
            Cell::new(&d.version),
            Cell::new(d.stages.len()),
            Cell::new(d.tags.join(", ")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(id: &str, state: &AppState, json: bool) -> Result<()> {
    let def: WorkflowDefinition = state.workflow_service.get_workflow(id).await?;
    if json {
        print_json(&def)
    } else {
        print!("{}", serialize_workflow_yaml(&def)?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

async fn handle_delete(id: &str, yes: bool, state: &AppState, json: bool) -> Result<()> {
    let def = state.workflow_service.get_workflow(id).await?;

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete workflow '{}' ({})?", def.id, def.name))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("  Aborted.");
            return Ok(());
        }
    }

    state.workflow_service.delete_workflow(id).await?;

    if json {
        print_json(&json!({ "deleted": id }))?;
    } else {
        println!();
        println!(
            "  {} Deleted workflow '{}'",
            style("*").green().bold(),
            style(id).cyan()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

fn handle_schema() -> Result<()> {
    let schema = schema_for!(WorkflowDefinition);
    print_json(&schema)
}
