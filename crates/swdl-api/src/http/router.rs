//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`, plus an unauthenticated `/health`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .merge(handlers::workflow::workflow_routes())
        .merge(handlers::execution::execution_routes());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::testing::{GATED_YAML, SAMPLE_YAML};

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_yaml(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/yaml")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    /// Poll until the execution leaves `running`.
    async fn wait_settled(router: &Router, id: &str) -> Value {
        for _ in 0..100 {
            let (_, body) = send(router, get(&format!("/api/v1/executions/{id}"))).await;
            if body["data"]["status"] != "running" {
                return body["data"].clone();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("execution {id} never settled");
    }

    #[tokio::test]
    async fn test_health() {
        let router = build_router(AppState::in_memory());
        let (status, body) = send(&router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_workflow_crud() {
        let router = build_router(AppState::in_memory());

        let (status, body) = send(&router, post_yaml("/api/v1/workflows", SAMPLE_YAML)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["id"], "sample");
        assert_eq!(body["_links"]["self"], "/api/v1/workflows/sample");

        let (status, body) = send(&router, post_yaml("/api/v1/workflows", SAMPLE_YAML)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errors"][0]["code"], "CONFLICT");

        let (status, body) = send(&router, get("/api/v1/workflows")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, _) = send(&router, get("/api/v1/workflows/sample")).await;
        assert_eq!(status, StatusCode::OK);

        let mut updated: Value = serde_json::to_value(crate::testing::sample_definition("sample")).unwrap();
        updated["description"] = json!("second revision");
        let request = Request::builder()
            .method("PUT")
            .uri("/api/v1/workflows/sample")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(updated.to_string()))
            .unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["description"], "second revision");

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/v1/workflows/sample")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&router, get("/api/v1/workflows/sample")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "NOT_FOUND");
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_definitions() {
        let router = build_router(AppState::in_memory());

        let (status, body) = send(&router, post_yaml("/api/v1/workflows", "name: [unclosed")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["errors"][0]["code"], "PARSE_ERROR");

        let cyclic = r#"
name: Loop
stages:
  - { id: a, name: A, depends_on: [b], roles: { primary: "agent:a" } }
  - { id: b, name: B, depends_on: [a], roles: { primary: "agent:b" } }
"#;
        let (status, body) = send(&router, post_yaml("/api/v1/workflows", cyclic)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["errors"][0]["code"], "CYCLE_DETECTED");
    }

    #[tokio::test]
    async fn test_validate_reports_without_storing() {
        let state = AppState::in_memory();
        let router = build_router(state.clone());

        let (status, body) = send(&router, post_yaml("/api/v1/workflows/validate", SAMPLE_YAML)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["valid"], true);
        assert!(state.workflow_service.list_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_with_parameters() {
        let router = build_router(AppState::in_memory());
        send(&router, post_yaml("/api/v1/workflows", SAMPLE_YAML)).await;

        let (status, body) = send(
            &router,
            post_json("/api/v1/workflows/sample/plan", json!({"parameters": {"topic": "wasm"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["batches"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"]["parameters"]["topic"], "wasm");

        let (status, body) = send(&router, post_empty("/api/v1/workflows/sample/plan")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["parameters"]["topic"], "rust");

        let (status, _) = send(&router, post_empty("/api/v1/workflows/missing/plan")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_runs_in_background() {
        let router = build_router(AppState::in_memory());
        send(&router, post_yaml("/api/v1/workflows", SAMPLE_YAML)).await;

        let (status, body) = send(&router, post_empty("/api/v1/workflows/sample/executions")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["data"]["id"].as_str().unwrap().to_string();
        assert!(body["_links"]["stream"].as_str().unwrap().ends_with("/stream"));

        let settled = wait_settled(&router, &id).await;
        assert_eq!(settled["status"], "completed");

        let (status, body) = send(&router, get("/api/v1/executions?workflow_id=sample&status=completed")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = send(&router, get(&format!("/api/v1/executions/{id}/events?after=1"))).await;
        assert_eq!(status, StatusCode::OK);
        let events = body["data"].as_array().unwrap();
        assert_eq!(events[0]["sequence"], 2);
        assert_eq!(events.last().unwrap()["event_type"], "execution.completed");
    }

    #[tokio::test]
    async fn test_gate_approval_and_state_errors() {
        let router = build_router(AppState::in_memory());
        send(&router, post_yaml("/api/v1/workflows", GATED_YAML)).await;

        let (_, body) = send(&router, post_empty("/api/v1/workflows/gated/executions")).await;
        let id = body["data"]["id"].as_str().unwrap().to_string();
        let paused = wait_settled(&router, &id).await;
        assert_eq!(paused["status"], "paused");

        let (status, body) = send(&router, post_empty(&format!("/api/v1/executions/{id}/resume"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errors"][0]["code"], "INVALID_STATE");

        let (status, _) = send(
            &router,
            post_empty(&format!("/api/v1/executions/{id}/gates/nope/approve")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &router,
            post_empty(&format!("/api/v1/executions/{id}/gates/review/approve")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "completed");

        let (status, _) = send(&router, post_empty(&format!("/api/v1/executions/{id}/cancel"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_reject_with_reason() {
        let router = build_router(AppState::in_memory());
        send(&router, post_yaml("/api/v1/workflows", GATED_YAML)).await;
        let (_, body) = send(&router, post_empty("/api/v1/workflows/gated/executions")).await;
        let id = body["data"]["id"].as_str().unwrap().to_string();
        wait_settled(&router, &id).await;

        let (status, body) = send(
            &router,
            post_json(
                &format!("/api/v1/executions/{id}/gates/review/reject"),
                json!({"reason": "needs work"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "failed");
        assert!(body["data"]["error_message"].as_str().unwrap().contains("needs work"));
    }

    #[tokio::test]
    async fn test_stream_replays_finished_execution() {
        let router = build_router(AppState::in_memory());
        send(&router, post_yaml("/api/v1/workflows", SAMPLE_YAML)).await;
        let (_, body) = send(&router, post_empty("/api/v1/workflows/sample/executions")).await;
        let id = body["data"]["id"].as_str().unwrap().to_string();
        wait_settled(&router, &id).await;

        let response = router
            .clone()
            .oneshot(get(&format!("/api/v1/executions/{id}/stream")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = tokio::time::timeout(
            Duration::from_secs(5),
            to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .unwrap()
        .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.contains("event: execution.started"));
        assert!(text.contains("event: stage.completed"));
        assert!(text.trim_end().contains("event: execution.completed"));
        assert!(text.contains("id: 1\n"));
    }

    #[tokio::test]
    async fn test_bad_ids_and_queries() {
        let router = build_router(AppState::in_memory());

        let (status, body) = send(&router, get("/api/v1/executions/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["code"], "BAD_REQUEST");

        let (status, _) = send(&router, get("/api/v1/executions?status=sleeping")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&router, get(&format!("/api/v1/executions/{}", uuid::Uuid::now_v7()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&router, get(&format!("/api/v1/executions/{}/stream", uuid::Uuid::now_v7()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
