//! JSON envelope shared by every REST response.
//!
//! ```json
//! {
//!   "data": { "id": "etl", ... },
//!   "meta": { "request_id": "0192...", "timestamp": "2025-01-01T00:00:00Z", "response_time_ms": 3 },
//!   "_links": { "plan": "/api/v1/workflows/etl/plan" }
//! }
//! ```
//!
//! Failures carry `errors` instead of `data`; see [`super::error::AppError`].

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub meta: ApiMeta,
    /// `{code, message, details?}` objects; only present on failure.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Value>,
    /// Relation name to path, for navigating from a workflow to its
    /// executions and from an execution to its event log.
    #[serde(rename = "_links", skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ApiMeta {
    pub request_id: String,
    pub timestamp: String,
    pub response_time_ms: u64,
}

impl ApiMeta {
    fn now(request_id: String, response_time_ms: u64) -> Self {
        Self {
            request_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            response_time_ms,
        }
    }
}

/// Started at the top of a handler; stamps the envelope it produces with an
/// id and the handler's elapsed time.
pub struct RequestTimer {
    request_id: Uuid,
    started: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self {
            request_id: Uuid::now_v7(),
            started: Instant::now(),
        }
    }

    pub fn respond<T: Serialize>(self, data: T) -> ApiResponse<T> {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        ApiResponse::success(data, self.request_id.to_string(), elapsed)
    }
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T, request_id: String, response_time_ms: u64) -> Self {
        Self {
            data: Some(data),
            meta: ApiMeta::now(request_id, response_time_ms),
            errors: Vec::new(),
            links: BTreeMap::new(),
        }
    }

    pub fn with_link(mut self, rel: &str, href: impl Into<String>) -> Self {
        self.links.insert(rel.to_string(), href.into());
        self
    }
}

impl ApiResponse<()> {
    /// Envelope for a rejected request. Errors are raised outside any
    /// handler's timer, so they get a fresh id and no timing.
    pub fn failure(errors: Vec<Value>) -> Self {
        Self {
            data: None,
            meta: ApiMeta::now(Uuid::now_v7().to_string(), 0),
            errors,
            links: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_has_data_and_links_but_no_errors() {
        let value = serde_json::to_value(
            RequestTimer::start()
                .respond(json!({"id": "etl"}))
                .with_link("plan", "/api/v1/workflows/etl/plan"),
        )
        .unwrap();

        assert_eq!(value["data"]["id"], "etl");
        assert!(Uuid::parse_str(value["meta"]["request_id"].as_str().unwrap()).is_ok());
        assert_eq!(value["_links"]["plan"], "/api/v1/workflows/etl/plan");
        assert!(value.get("errors").is_none());
    }

    #[test]
    fn failure_has_errors_but_no_data() {
        let value = serde_json::to_value(ApiResponse::failure(vec![
            json!({"code": "NOT_FOUND", "message": "workflow 'etl' not found"}),
        ]))
        .unwrap();

        assert!(value.get("data").is_none());
        assert!(value.get("_links").is_none());
        assert_eq!(value["errors"][0]["code"], "NOT_FOUND");
        assert_eq!(value["meta"]["response_time_ms"], 0);
    }
}
