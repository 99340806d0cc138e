//! Workflow definition handlers for the REST API.
//!
//! Definitions are accepted as JSON or, with a YAML content type, as YAML,
//! and go through the same parser as files loaded by the CLI.

use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use swdl_core::service::WorkflowService;
use swdl_core::workflow::definition::{SourceFormat, WorkflowError, parse_workflow_str};
use swdl_core::workflow::planner::ExecutionPlan;
use swdl_core::workflow::validator::ValidationResult;
use swdl_types::execution::{ExecutionOverrides, WorkflowExecution};
use swdl_types::workflow::WorkflowDefinition;

use super::json_or_default;
use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::{AppState, WorkflowStore};

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct PlanRequest {
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub overrides: ExecutionOverrides,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the workflow sub-router, mounted at `/api/v1`.
pub fn workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/validate", post(validate_workflow))
        .route(
            "/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/workflows/{id}/plan", post(plan_workflow))
        .route("/workflows/{id}/executions", post(start_execution))
}

/// Parse a definition body, choosing YAML when the content type says so.
fn parse_body(headers: &HeaderMap, body: &str) -> Result<WorkflowDefinition, AppError> {
    let is_yaml = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("yaml"));
    let format = if is_yaml {
        SourceFormat::Yaml
    } else {
        SourceFormat::Json
    };
    Ok(parse_workflow_str(body, format)?)
}

// ---------------------------------------------------------------------------
// Definition CRUD
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows - Store a new definition.
pub async fn create_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowDefinition>>), AppError> {
    let timer = RequestTimer::start();
    let def = parse_body(&headers, &body)?;

    // Dependency and cycle problems are rejected before storing.
    let report = WorkflowService::<WorkflowStore>::validate_workflow(&def)?;
    if !report.valid {
        return Err(AppError::Workflow(validation_failure(&report)));
    }

    let stored = state.workflow_service.create_workflow(def).await?;
    let href = format!("/api/v1/workflows/{}", stored.id);
    Ok((
        StatusCode::CREATED,
        Json(timer.respond(stored).with_link("self", href)),
    ))
}

/// GET /api/v1/workflows - List stored definitions.
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WorkflowDefinition>>>, AppError> {
    let timer = RequestTimer::start();
    let defs = state.workflow_service.list_workflows().await?;
    Ok(Json(timer.respond(defs)))
}

/// GET /api/v1/workflows/{id}
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let timer = RequestTimer::start();
    let def = state.workflow_service.get_workflow(&id).await?;
    Ok(Json(
        timer
            .respond(def)
            .with_link("plan", format!("/api/v1/workflows/{id}/plan"))
            .with_link("executions", format!("/api/v1/executions?workflow_id={id}")),
    ))
}

/// PUT /api/v1/workflows/{id} - Replace a stored definition.
pub async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let timer = RequestTimer::start();
    let mut def = parse_body(&headers, &body)?;
    def.id = id.clone();

    let report = WorkflowService::<WorkflowStore>::validate_workflow(&def)?;
    if !report.valid {
        return Err(AppError::Workflow(validation_failure(&report)));
    }

    let stored = state.workflow_service.update_workflow(&id, def).await?;
    Ok(Json(timer.respond(stored)))
}

/// DELETE /api/v1/workflows/{id}
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    state.workflow_service.delete_workflow(&id).await?;
    Ok(Json(timer.respond(json!({ "deleted": id }))))
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows/validate - Report on a definition without storing it.
///
/// Expression problems come back as a report with `valid: false`; parse
/// errors and cycles are rejected with 422.
pub async fn validate_workflow(
    headers: HeaderMap,
    body: String,
) -> Result<Json<ApiResponse<ValidationResult>>, AppError> {
    let timer = RequestTimer::start();
    let def = parse_body(&headers, &body)?;
    let report = WorkflowService::<WorkflowStore>::validate_workflow(&def)?;
    Ok(Json(timer.respond(report)))
}

/// POST /api/v1/workflows/{id}/plan
pub async fn plan_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<PlanRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<ExecutionPlan>>, AppError> {
    let timer = RequestTimer::start();
    let request = json_or_default(body)?;
    let plan = state
        .workflow_service
        .plan_workflow(&id, &request.parameters)
        .await?;
    Ok(Json(timer.respond(plan)))
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows/{id}/executions - Start an execution and dispatch
/// it in the background.
pub async fn start_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowExecution>>), AppError> {
    let timer = RequestTimer::start();
    let request = json_or_default(body)?;

    let execution = state
        .execution_service
        .start_execution(&id, request.parameters, request.overrides)
        .await?;

    let service = state.execution_service.clone();
    let execution_id = execution.id;
    tokio::spawn(async move {
        if let Err(e) = service.run_execution(execution_id).await {
            tracing::error!(execution_id = %execution_id, error = %e, "background run failed");
        }
    });

    let base = format!("/api/v1/executions/{execution_id}");
    let response = timer
        .respond(execution)
        .with_link("events", format!("{base}/events"))
        .with_link("stream", format!("{base}/stream"))
        .with_link("self", base);
    Ok((StatusCode::ACCEPTED, Json(response)))
}

fn validation_failure(report: &ValidationResult) -> WorkflowError {
    let messages: Vec<String> = report
        .errors
        .iter()
        .map(|i| format!("{} ({}): {}", i.stage_id, i.field, i.message))
        .collect();
    WorkflowError::Validation(messages.join("; "))
}
