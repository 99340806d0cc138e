//! HTTP request handlers for the REST API.

pub mod execution;
pub mod workflow;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use uuid::Uuid;

use crate::http::error::AppError;

/// Optional JSON body: a request without a JSON content type gets the
/// default; a malformed one is rejected.
pub(crate) fn json_or_default<T: Default>(
    body: Result<Json<T>, JsonRejection>,
) -> Result<T, AppError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn parse_execution_id(raw: &str) -> Result<Uuid, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid execution id '{raw}'")))
}
