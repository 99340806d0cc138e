//! Execution inspection and control handlers for the REST API.
//!
//! Control endpoints await the service call, so a gate approval or resume
//! responds once dispatch stops again. Live progress is available from the
//! SSE stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use swdl_core::repository::ExecutionFilter;
use swdl_types::execution::{ExecutionEvent, ExecutionStatus, WorkflowExecution};
use tokio::sync::broadcast::error::RecvError;

use super::{json_or_default, parse_execution_id};
use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query parameters and bodies
// ---------------------------------------------------------------------------

/// Query parameters for listing executions.
#[derive(Debug, Default, Deserialize)]
pub struct ListExecutionsQuery {
    pub workflow_id: Option<String>,
    pub status: Option<String>,
    /// Defaults to `default_list_limit` from config.toml.
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only events with a greater sequence number.
    #[serde(default)]
    pub after: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the execution sub-router, mounted at `/api/v1`.
pub fn execution_routes() -> Router<AppState> {
    Router::new()
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/pause", post(pause_execution))
        .route("/executions/{id}/resume", post(resume_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/executions/{id}/gates/{stage_id}/approve", post(approve_gate))
        .route("/executions/{id}/gates/{stage_id}/reject", post(reject_gate))
        .route("/executions/{id}/events", get(list_events))
        .route("/executions/{id}/stream", get(stream_events))
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// GET /api/v1/executions?workflow_id=&status=&limit=
pub async fn list_executions(
    State(state): State<AppState>,
    query: Result<Query<ListExecutionsQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<Vec<WorkflowExecution>>>, AppError> {
    let timer = RequestTimer::start();
    let Query(query) = query?;

    let status = query
        .status
        .as_deref()
        .map(str::parse::<ExecutionStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let filter = ExecutionFilter {
        workflow_id: query.workflow_id,
        status,
        limit: state.list_limit(query.limit),
    };

    let executions = state.execution_service.list_executions(&filter).await?;
    Ok(Json(timer.respond(executions)))
}

/// GET /api/v1/executions/{id}
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let timer = RequestTimer::start();
    let id = parse_execution_id(&id)?;
    let execution = state.execution_service.get_execution(id).await?;
    Ok(Json(with_execution_links(timer.respond(execution), &id.to_string())))
}

/// GET /api/v1/executions/{id}/events?after=
pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<Vec<ExecutionEvent>>>, AppError> {
    let timer = RequestTimer::start();
    let id = parse_execution_id(&id)?;
    let Query(query) = query?;
    let events = state.execution_service.list_events(id, query.after).await?;
    Ok(Json(timer.respond(events)))
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// POST /api/v1/executions/{id}/pause
pub async fn pause_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state
        .execution_service
        .pause_execution(parse_execution_id(&id)?)
        .await?;
    Ok(Json(timer.respond(execution)))
}

/// POST /api/v1/executions/{id}/resume
pub async fn resume_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state
        .execution_service
        .resume_execution(parse_execution_id(&id)?)
        .await?;
    Ok(Json(timer.respond(execution)))
}

/// POST /api/v1/executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state
        .execution_service
        .cancel_execution(parse_execution_id(&id)?)
        .await?;
    Ok(Json(timer.respond(execution)))
}

/// POST /api/v1/executions/{id}/gates/{stage_id}/approve
pub async fn approve_gate(
    State(state): State<AppState>,
    Path((id, stage_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state
        .execution_service
        .approve_gate(parse_execution_id(&id)?, &stage_id)
        .await?;
    Ok(Json(timer.respond(execution)))
}

/// POST /api/v1/executions/{id}/gates/{stage_id}/reject
pub async fn reject_gate(
    State(state): State<AppState>,
    Path((id, stage_id)): Path<(String, String)>,
    body: Result<Json<RejectRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let timer = RequestTimer::start();
    let request = json_or_default(body)?;
    let reason = request.reason.unwrap_or_else(|| "rejected".to_string());
    let execution = state
        .execution_service
        .reject_gate(parse_execution_id(&id)?, &stage_id, &reason)
        .await?;
    Ok(Json(timer.respond(execution)))
}

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

/// GET /api/v1/executions/{id}/stream - Stored events, then live ones, until
/// the execution reaches a terminal status.
///
/// SSE event types: the event type string (`stage.completed`, ...), with the
/// sequence number as the SSE id and the full event as JSON data.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let id = parse_execution_id(&id)?;
    let service = state.execution_service.clone();

    // Subscribe before reading the log so nothing falls between the two.
    let mut rx = service.subscribe();
    let stored = service.list_events(id, 0).await?;

    let stream = async_stream::stream! {
        let mut last = 0u64;
        let mut finished = false;

        for event in stored {
            last = event.sequence;
            finished |= ends_stream(&event);
            yield Ok::<_, Infallible>(to_sse(&event));
        }

        while !finished {
            match rx.recv().await {
                Ok(event) => {
                    if event.execution_id != id || event.sequence <= last {
                        continue;
                    }
                    last = event.sequence;
                    finished = ends_stream(&event);
                    yield Ok(to_sse(&event));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(execution_id = %id, skipped, "event stream lagged, reading from store");
                    match service.list_events(id, last).await {
                        Ok(missed) => {
                            for event in missed {
                                last = event.sequence;
                                finished |= ends_stream(&event);
                                yield Ok(to_sse(&event));
                            }
                        }
                        Err(e) => {
                            tracing::error!(execution_id = %id, error = %e, "failed to catch up event stream");
                            break;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn ends_stream(event: &ExecutionEvent) -> bool {
    event
        .event_type
        .execution_status()
        .is_some_and(|s| s.is_terminal())
}

fn to_sse(event: &ExecutionEvent) -> Event {
    Event::default()
        .event(event.event_type.as_str())
        .id(event.sequence.to_string())
        .data(serde_json::to_string(event).unwrap_or_default())
}

fn with_execution_links<T: serde::Serialize>(response: ApiResponse<T>, id: &str) -> ApiResponse<T> {
    let base = format!("/api/v1/executions/{id}");
    response
        .with_link("events", format!("{base}/events"))
        .with_link("stream", format!("{base}/stream"))
        .with_link("self", base)
}
