//! Terminal rendering shared by the workflow and execution commands.

use std::fmt::Write as _;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;
use swdl_core::workflow::planner::ExecutionPlan;
use swdl_core::workflow::validator::{ValidationIssue, ValidationResult};
use swdl_types::execution::{ExecutionEvent, ExecutionStatus, StepStatus, WorkflowExecution};
use uuid::Uuid;

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Pending => Color::Yellow,
        ExecutionStatus::Running => Color::Blue,
        ExecutionStatus::Paused => Color::Magenta,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Pending => Color::Grey,
        StepStatus::Running => Color::Blue,
        StepStatus::Completed => Color::Green,
        StepStatus::Skipped => Color::DarkYellow,
        StepStatus::Failed => Color::Red,
        StepStatus::WaitingForApproval => Color::Magenta,
    };
    Cell::new(status.as_str()).fg(color)
}

fn issue_line(issue: &ValidationIssue) -> String {
    format!("{} ({}): {}", issue.stage_id, issue.field, issue.message)
}

pub fn print_validation(name: &str, result: &ValidationResult) {
    println!();
    if result.valid {
        println!(
            "  {} '{}' is valid",
            style("✓").green().bold(),
            style(name).cyan()
        );
    } else {
        println!(
            "  {} '{}' has {} error(s)",
            style("✗").red().bold(),
            style(name).cyan(),
            result.errors.len()
        );
    }
    for issue in &result.errors {
        println!("    {} {}", style("error").red(), issue_line(issue));
    }
    for issue in &result.warnings {
        println!("    {} {}", style("warning").yellow(), issue_line(issue));
    }
    println!();
}

pub fn print_plan(plan: &ExecutionPlan) {
    print!("{}", render_plan(plan));
}

/// Human-readable plan: batches in order, each stage's role, model, inputs,
/// outputs and timeout, then the estimated total and any validator findings.
pub fn render_plan(plan: &ExecutionPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "\n  {} {} {}\n",
        style("Plan for").bold(),
        style(&plan.name).cyan(),
        style(format!("v{}", plan.version)).dim()
    );

    for batch in &plan.batches {
        let _ = writeln!(out, "  {}", style(format!("Batch {}", batch.index)).bold());
        for stage in batch.stage_ids.iter().filter_map(|id| plan.stage(id)) {
            let _ = writeln!(
                out,
                "    {} [{}] {}",
                style(&stage.id).cyan(),
                stage.stage_type.as_str(),
                style(&stage.name).dim()
            );
            match (&stage.primary, &stage.gate) {
                (Some(primary), _) => {
                    let _ = writeln!(out, "      role:    {primary}");
                }
                (None, Some(gate)) => {
                    let approvers = if gate.approvers.is_empty() {
                        "anyone".to_string()
                    } else {
                        gate.approvers.join(", ")
                    };
                    let _ = writeln!(out, "      gate:    {approvers} within {}", gate.timeout);
                }
                (None, None) => {}
            }
            if let Some(model) = &stage.model {
                let _ = writeln!(out, "      model:   {model}");
            }
            if !stage.depends_on.is_empty() {
                let _ = writeln!(out, "      after:   {}", stage.depends_on.join(", "));
            }
            if let Some(condition) = &stage.condition {
                let _ = writeln!(out, "      if:      {condition}");
            }
            for (name, source) in &stage.inputs {
                let _ = writeln!(out, "      in:      {name} <- {source}");
            }
            for (name, contract) in &stage.outputs {
                let _ = writeln!(out, "      out:     {name}: {contract}");
            }
            let _ = writeln!(
                out,
                "      timeout: {} ({} attempt(s))",
                stage.timeout, stage.max_attempts
            );
        }
        out.push('\n');
    }

    let _ = writeln!(
        out,
        "  Estimated worst case: {} across {} batch(es)",
        style(&plan.estimated_timeout).bold(),
        plan.batches.len()
    );
    for issue in &plan.validation.errors {
        let _ = writeln!(out, "    {} {}", style("error").red(), issue_line(issue));
    }
    for issue in &plan.validation.warnings {
        let _ = writeln!(out, "    {} {}", style("warning").yellow(), issue_line(issue));
    }
    out.push('\n');
    out
}

pub fn print_execution(execution: &WorkflowExecution) {
    println!();
    println!(
        "  {} {} ({})",
        style("Execution").bold(),
        style(execution.id).cyan(),
        style(&execution.workflow_name).dim()
    );
    println!("  Status: {}", execution.status);
    println!("  Started: {}", execution.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = execution.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref err) = execution.error_message {
        println!("  Error: {}", style(err).red());
    }
    println!();

    let mut table = table();
    table.set_header(vec![
        Cell::new("Stage").fg(Color::Cyan),
        Cell::new("Batch"),
        Cell::new("Type"),
        Cell::new("Status"),
        Cell::new("Attempt"),
        Cell::new("Detail"),
    ]);
    for step in &execution.steps {
        let detail = match (&step.error_message, step.gate_deadline) {
            (Some(err), _) => err.clone(),
            (None, Some(deadline)) if step.status == StepStatus::WaitingForApproval => {
                format!("approve before {}", deadline.format("%Y-%m-%d %H:%M"))
            }
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(&step.stage_id),
            Cell::new(step.batch_index),
            Cell::new(step.stage_type.as_str()),
            step_status_cell(step.status),
            Cell::new(step.attempt),
            Cell::new(detail),
        ]);
    }
    println!("{table}");
    println!();
}

pub fn print_executions(executions: &[WorkflowExecution]) {
    let mut table = table();
    table.set_header(vec![
        Cell::new("ID").fg(Color::Cyan),
        Cell::new("Workflow"),
        Cell::new("Status"),
        Cell::new("Started"),
        Cell::new("Completed"),
    ]);
    for e in executions {
        let completed = e
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(short_id(&e.id)),
            Cell::new(&e.workflow_id),
            status_cell(e.status),
            Cell::new(e.started_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(completed),
        ]);
    }
    println!();
    println!("{table}");
    println!();
}

pub fn print_events(events: &[ExecutionEvent]) {
    let mut table = table();
    table.set_header(vec![
        Cell::new("#").fg(Color::Cyan),
        Cell::new("Time"),
        Cell::new("Event"),
        Cell::new("Stage"),
        Cell::new("Payload"),
    ]);
    for event in events {
        table.add_row(vec![
            Cell::new(event.sequence),
            Cell::new(event.created_at.format("%H:%M:%S%.3f").to_string()),
            Cell::new(event.event_type.as_str()),
            Cell::new(event.stage_id().unwrap_or("-")),
            Cell::new(event.payload.to_string()),
        ]);
    }
    println!();
    println!("{table}");
    println!();
}

/// One-line summary printed after a state-changing command.
pub fn print_outcome(verb: &str, execution: &WorkflowExecution) {
    let marker = match execution.status {
        ExecutionStatus::Completed => style("✓").green().bold(),
        ExecutionStatus::Failed => style("✗").red().bold(),
        ExecutionStatus::Paused => style("⏸").magenta().bold(),
        _ => style("*").cyan().bold(),
    };
    println!();
    println!(
        "  {} {} execution {} -- now {}",
        marker,
        verb,
        style(short_id(&execution.id)).cyan(),
        execution.status
    );
    for gate in execution.waiting_gates() {
        println!(
            "    waiting for approval: {} (swdl execution approve {} {})",
            style(&gate.stage_id).yellow(),
            execution.id,
            gate.stage_id
        );
    }
    if let Some(ref err) = execution.error_message {
        println!("    {}", style(err).red());
    }
    println!();
}
