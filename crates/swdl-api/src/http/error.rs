//! Application error type mapping to HTTP status codes and envelope format.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::Json;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use swdl_core::workflow::definition::WorkflowError;
use swdl_types::error::RepositoryError;

use super::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Errors raised by the workflow services.
    Workflow(WorkflowError),
    /// Malformed request body or query string.
    BadRequest(String),
}

impl From<WorkflowError> for AppError {
    fn from(e: WorkflowError) -> Self {
        AppError::Workflow(e)
    }
}

impl From<JsonRejection> for AppError {
    fn from(e: JsonRejection) -> Self {
        AppError::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(e: QueryRejection) -> Self {
        AppError::BadRequest(e.body_text())
    }
}

impl AppError {
    /// Status code and machine-readable error code.
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Workflow(e) => match e {
                WorkflowError::NotFound { .. } | WorkflowError::StageNotFound(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                }
                WorkflowError::Repository(RepositoryError::NotFound) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                }
                WorkflowError::Parse { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "PARSE_ERROR"),
                WorkflowError::Validation(_) | WorkflowError::ArtifactReference { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR")
                }
                WorkflowError::Cycle { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "CYCLE_DETECTED"),
                WorkflowError::Expression(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "EXPRESSION_ERROR")
                }
                WorkflowError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
                WorkflowError::Conflict(_) | WorkflowError::Repository(RepositoryError::Conflict(_)) => {
                    (StatusCode::CONFLICT, "CONFLICT")
                }
                WorkflowError::Repository(RepositoryError::Unavailable(_)) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE")
                }
                WorkflowError::Repository(_) | WorkflowError::Io(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Workflow(e) => e.to_string(),
            AppError::BadRequest(msg) => msg.clone(),
        }
    }

    /// Field-level problems of a parse error, if any.
    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::Workflow(WorkflowError::Parse { messages, .. }) => Some(json!(messages)),
            AppError::Workflow(WorkflowError::Cycle { path }) => Some(json!({ "cycle": path })),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        let message = self.message();
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        } else {
            tracing::debug!(code, error = %message, "request rejected");
        }

        let mut error = json!({
            "code": code,
            "message": message,
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }

        let body = ApiResponse::<()>::failure(vec![error]);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swdl_types::execution::ExecutionStatus;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (WorkflowError::workflow_not_found("x"), StatusCode::NOT_FOUND),
            (
                WorkflowError::Cycle {
                    path: vec!["a".into(), "b".into(), "a".into()],
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                WorkflowError::Validation("bad".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                WorkflowError::InvalidState {
                    id: Uuid::now_v7(),
                    status: ExecutionStatus::Completed,
                    operation: "pause",
                },
                StatusCode::CONFLICT,
            ),
            (WorkflowError::Conflict("dup".into()), StatusCode::CONFLICT),
            (
                WorkflowError::Repository(RepositoryError::Query("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                WorkflowError::Repository(RepositoryError::Unavailable("pool closed".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status().0, expected);
        }
    }

    #[test]
    fn test_bad_request_status() {
        let err = AppError::BadRequest("nope".into());
        assert_eq!(err.status(), (StatusCode::BAD_REQUEST, "BAD_REQUEST"));
    }
}
