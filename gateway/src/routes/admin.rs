//! Operational side-channel: backend cleanup, logging toggles, and the
//! test-model routing pin.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backend::sweep;
use crate::error::Result;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/cleanup", post(cleanup))
        .route("/v1/cleanup/status", get(cleanup_status))
        .route("/v1/logging", get(logging_state))
        .route("/v1/logging/toggle", post(logging_toggle))
        .route("/v1/logging/set", post(logging_set))
        .route("/test/model", get(test_model_get).post(test_model_set))
        .route("/test/model/clear", post(test_model_clear))
}

/// POST /v1/cleanup - terminate all local backends except the classifier.
async fn cleanup(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    // Reap our own resident first so its handle is not left dangling, then
    // sweep externally-started leftovers. Serialized like any GPU mutation.
    let orchestrator = state.orchestrator.clone();
    state
        .gpu
        .with_gpu(async move {
            orchestrator.clear_local_resident().await;
            Ok(())
        })
        .await?;

    let ports = sweep::cleanup_ports(&state.settings);
    let results = sweep::terminate_on_ports(&state.settings, &ports);
    Ok(Json(json!({ "results": results })))
}

/// GET /v1/cleanup/status - liveness per configured local port.
async fn cleanup_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = sweep::port_status(&state.http, &state.settings).await;
    let ports: Vec<Value> = status
        .into_iter()
        .map(|(port, up)| json!({ "port": port, "up": up }))
        .collect();
    Json(json!({ "ports": ports }))
}

/// GET /v1/logging - current debug-flag values.
async fn logging_state(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "enabled": state.flags.logging_enabled(),
        "ignoreRoleSystem": state.flags.ignore_role_system(),
        "testModel": state.flags.test_model(),
    }))
}

/// POST /v1/logging/toggle - flip the trace-event toggle.
async fn logging_toggle(State(state): State<Arc<AppState>>) -> Json<Value> {
    let enabled = !state.flags.logging_enabled();
    state.flags.set_logging(enabled);
    Json(json!({ "enabled": enabled }))
}

#[derive(Debug, Deserialize)]
struct LoggingSet {
    enabled: bool,
}

/// POST /v1/logging/set - set the trace-event toggle.
async fn logging_set(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoggingSet>,
) -> Json<Value> {
    state.flags.set_logging(body.enabled);
    Json(json!({ "enabled": body.enabled }))
}

/// GET /test/model - read the routing pin.
async fn test_model_get(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "testModel": state.flags.test_model() }))
}

#[derive(Debug, Deserialize)]
struct TestModelSet {
    model: String,
}

/// POST /test/model - pin all chat routing to one model.
async fn test_model_set(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TestModelSet>,
) -> Json<Value> {
    tracing::info!("Test-model pin set to {}", body.model);
    state.flags.set_test_model(Some(body.model.clone()));
    Json(json!({ "testModel": body.model }))
}

/// POST /test/model/clear - unpin.
async fn test_model_clear(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.flags.set_test_model(None);
    Json(json!({ "testModel": Value::Null }))
}
