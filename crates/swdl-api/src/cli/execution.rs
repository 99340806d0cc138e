//! CLI execution subcommands and `swdl run`.
//!
//! Gate approvals and resumes continue dispatch in this process, so they
//! show the same progress spinner as `run`.

use std::future::Future;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Subcommand;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use swdl_core::repository::ExecutionFilter;
use swdl_core::workflow::definition::WorkflowError;
use swdl_types::execution::{ExecutionOverrides, ExecutionStatus, WorkflowExecution};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::render::{print_events, print_execution, print_executions, print_json, print_outcome};
use super::{Target, parse_execution_id, parse_params, resolve_target};
use crate::state::AppState;

/// Execution subcommands.
#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// List executions, most recent first.
    #[command(alias = "ls")]
    List {
        /// Only executions of this workflow id.
        #[arg(long)]
        workflow: Option<String>,

        /// Only executions in this status.
        #[arg(long)]
        status: Option<ExecutionStatus>,

        /// Maximum number of executions to show.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show an execution and its steps.
    Show {
        /// Execution UUID.
        id: String,
    },

    /// Show the event log of an execution.
    Events {
        /// Execution UUID.
        id: String,

        /// Only events after this sequence number.
        #[arg(long, default_value = "0")]
        after: u64,
    },

    /// Approve a waiting gate and continue the execution.
    Approve {
        /// Execution UUID.
        id: String,

        /// Gate stage id.
        stage: String,
    },

    /// Reject a waiting gate.
    Reject {
        /// Execution UUID.
        id: String,

        /// Gate stage id.
        stage: String,

        /// Reason recorded on the gate step.
        #[arg(long, default_value = "rejected")]
        reason: String,
    },

    /// Pause an execution at the next batch boundary.
    Pause {
        /// Execution UUID.
        id: String,
    },

    /// Resume a paused execution.
    Resume {
        /// Execution UUID.
        id: String,
    },

    /// Cancel an execution.
    Cancel {
        /// Execution UUID.
        id: String,
    },
}

/// Handle an execution subcommand.
pub async fn handle_execution_command(
    cmd: ExecutionCommand,
    state: &AppState,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let service = &state.execution_service;
    match cmd {
        ExecutionCommand::List {
            workflow,
            status,
            limit,
        } => {
            let filter = ExecutionFilter {
                workflow_id: workflow,
                status,
                limit: state.list_limit(limit),
            };
            let executions = service.list_executions(&filter).await?;
            if json {
                print_json(&executions)
            } else if executions.is_empty() {
                println!();
                println!("  No executions found.");
                println!();
                Ok(())
            } else {
                print_executions(&executions);
                Ok(())
            }
        }
        ExecutionCommand::Show { id } => {
            let execution = service.get_execution(parse_execution_id(&id)?).await?;
            if json {
                print_json(&execution)
            } else {
                print_execution(&execution);
                Ok(())
            }
        }
        ExecutionCommand::Events { id, after } => {
            let events = service.list_events(parse_execution_id(&id)?, after).await?;
            if json {
                print_json(&events)
            } else {
                print_events(&events);
                Ok(())
            }
        }
        ExecutionCommand::Approve { id, stage } => {
            let id = parse_execution_id(&id)?;
            let progress = !(json || quiet);
            let execution = with_progress(state, id, progress, service.approve_gate(id, &stage)).await?;
            report(&execution, "Approved gate in", json)
        }
        ExecutionCommand::Reject { id, stage, reason } => {
            let id = parse_execution_id(&id)?;
            let progress = !(json || quiet);
            let execution =
                with_progress(state, id, progress, service.reject_gate(id, &stage, &reason)).await?;
            report(&execution, "Rejected gate in", json)
        }
        ExecutionCommand::Pause { id } => {
            let execution = service.pause_execution(parse_execution_id(&id)?).await?;
            report(&execution, "Paused", json)
        }
        ExecutionCommand::Resume { id } => {
            let id = parse_execution_id(&id)?;
            let progress = !(json || quiet);
            let execution = with_progress(state, id, progress, service.resume_execution(id)).await?;
            report(&execution, "Resumed", json)
        }
        ExecutionCommand::Cancel { id } => {
            let execution = service.cancel_execution(parse_execution_id(&id)?).await?;
            report(&execution, "Cancelled", json)
        }
    }
}

/// `swdl run <file|id>`: start an execution and dispatch it until it
/// settles or stops at a gate.
pub async fn handle_run(
    target: &str,
    raw_params: &[String],
    timeout: Option<String>,
    state: &AppState,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let params = parse_params(raw_params)?;
    let overrides = ExecutionOverrides {
        timeout,
        ..ExecutionOverrides::default()
    };

    let service = &state.execution_service;
    let started = match resolve_target(state, target).await? {
        Target::File(def) => service.start_definition(&def, params, overrides).await?,
        Target::Stored(def) => service.start_execution(&def.id, params, overrides).await?,
    };

    let progress = !(json || quiet);
    let execution = with_progress(state, started.id, progress, service.run_execution(started.id)).await?;
    report(&execution, "Ran", json)?;

    if execution.status == ExecutionStatus::Failed {
        bail!(
            "execution {} failed: {}",
            execution.id,
            execution.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn report(execution: &WorkflowExecution, verb: &str, json: bool) -> Result<()> {
    if json {
        return print_json(execution);
    }
    print_outcome(verb, execution);
    if execution.status.is_terminal() || execution.status == ExecutionStatus::Paused {
        print_execution(execution);
    }
    Ok(())
}

/// Drive `work` while a spinner shows the latest stage event of `id`.
async fn with_progress<F>(
    state: &AppState,
    id: Uuid,
    enabled: bool,
    work: F,
) -> Result<WorkflowExecution, WorkflowError>
where
    F: Future<Output = Result<WorkflowExecution, WorkflowError>>,
{
    if !enabled {
        return work.await;
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap(),
    );
    spinner.set_message(format!("Running {}...", style(id).dim()));
    spinner.enable_steady_tick(Duration::from_millis(80));

    let mut rx = state.execution_service.subscribe();
    let ticker = spinner.clone();
    let watcher = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.execution_id == id => {
                    let message = match event.stage_id() {
                        Some(stage) => format!("{} {}", event.event_type, style(stage).cyan()),
                        None => event.event_type.to_string(),
                    };
                    ticker.set_message(message);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = work.await;
    watcher.abort();
    spinner.finish_and_clear();
    result
}
