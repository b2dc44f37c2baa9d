//! Catch-all forwarding for other `/v1/...` paths.
//!
//! Anything not handled by a dedicated route must name a remote model; the
//! request is proxied to the same path on that model's upstream. Local models
//! have no generic surface beyond chat and transcription, so they are
//! rejected here.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use lols_common::ModelKind;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::proxy;
use crate::state::AppState;

const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Fallback handler: `/v1/*` forwarding, 404 for everything else.
pub async fn v1_catch_all(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Response {
    let path = request.uri().path().to_string();
    if !path.starts_with("/v1/") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let headers = request.headers().clone();
    match forward(state, &path, headers, request.into_body()).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward(
    state: Arc<AppState>,
    path: &str,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let bytes = axum::body::to_bytes(body, BODY_LIMIT)
        .await
        .map_err(|e| Error::BadRequest(format!("unreadable body: {}", e)))?;
    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|_| Error::BadRequest("body must be a JSON object".to_string()))?;

    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::BadRequest("model is required on this path".to_string()))?;

    let desc = state
        .settings
        .descriptor(model)
        .ok_or_else(|| Error::UnknownModel(model.to_string()))?;
    if desc.kind != ModelKind::RemoteHttp {
        return Err(Error::BadRequest(format!(
            "model '{}' is local; only remote models are served on {}",
            model, path
        )));
    }

    state.trace(format!("passthrough {} -> {}", path, desc.id));

    let timeout = proxy::request_timeout(&headers, desc);
    proxy::forward_remote_path(
        &state.http,
        desc,
        path,
        payload,
        timeout,
        CancellationToken::new(),
    )
    .await
}
