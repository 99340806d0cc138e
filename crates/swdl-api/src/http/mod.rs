//! HTTP/REST API layer for SWDL.
//!
//! Axum-based REST API at `/api/v1/` with an envelope response format,
//! SSE event streaming and CORS support.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
