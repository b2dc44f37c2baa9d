//! HTTP surface of the gateway.

pub mod admin;
pub mod audio;
pub mod chat;
pub mod models;
pub mod passthrough;

use axum::http::StatusCode;
use axum::Json;

/// GET /health - liveness probe.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}
