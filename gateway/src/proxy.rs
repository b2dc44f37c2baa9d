//! Streaming bidirectional proxy between clients and inference backends.
//!
//! One cancel token per request, fired by whichever comes first: the
//! per-request deadline or the client going away. The token aborts the
//! upstream call; a cold model load already inside the GPU lock is never
//! interrupted by it.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use lols_common::ModelKind;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{expand_env, ModelDescriptor};
use crate::error::{Error, Result};

/// Fallback per-request timeout, seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Header letting a client override the per-request timeout.
pub const TIMEOUT_HEADER: &str = "x-request-timeout";

/// Per-request timeout: `X-Request-Timeout` header, then the descriptor,
/// then 30 seconds.
pub fn request_timeout(headers: &HeaderMap, desc: &ModelDescriptor) -> Duration {
    let from_header = headers
        .get(TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    Duration::from_secs(from_header.unwrap_or_else(|| desc.timeout_secs()))
}

/// Arm the deadline leg of a cancel token. The returned handle is aborted
/// once the upstream call comes back, clearing the timer.
fn arm_deadline(cancel: &CancellationToken, timeout: Duration) -> tokio::task::JoinHandle<()> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        cancel.cancel();
    })
}

/// The upstream base of a remote descriptor for catch-all forwarding: the
/// configured chat endpoint with its `/v1/...` suffix removed.
pub fn remote_base(endpoint: &str) -> String {
    let expanded = expand_env(endpoint);
    match expanded.find("/v1/") {
        Some(idx) => expanded[..idx].to_string(),
        None => expanded.trim_end_matches('/').to_string(),
    }
}

/// Forward a chat payload to the descriptor's backend and relay the response,
/// streaming when the payload asks for it.
pub async fn forward_chat(
    client: &reqwest::Client,
    desc: &ModelDescriptor,
    payload: Value,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<Response> {
    let url = match desc.kind {
        ModelKind::RemoteHttp => expand_env(desc.endpoint.as_deref().unwrap_or_default()),
        _ => {
            let port = desc
                .port
                .ok_or_else(|| Error::Internal(format!("model '{}' has no port", desc.id)))?;
            format!("http://127.0.0.1:{}/v1/chat/completions", port)
        }
    };
    forward_json(client, desc, &url, payload, timeout, cancel).await
}

/// Forward a JSON payload to an arbitrary path on a remote descriptor's
/// upstream (the `/v1/*` catch-all).
pub async fn forward_remote_path(
    client: &reqwest::Client,
    desc: &ModelDescriptor,
    path: &str,
    payload: Value,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<Response> {
    let url = format!(
        "{}{}",
        remote_base(desc.endpoint.as_deref().unwrap_or_default()),
        path
    );
    forward_json(client, desc, &url, payload, timeout, cancel).await
}

async fn forward_json(
    client: &reqwest::Client,
    desc: &ModelDescriptor,
    url: &str,
    mut payload: Value,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<Response> {
    let stream = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut request = client.post(url);

    if desc.kind == ModelKind::RemoteHttp {
        // The upstream knows the model under its own name.
        if let Some(model) = &desc.model {
            payload["model"] = Value::String(model.clone());
        }
        let api_key = expand_env(desc.api_key.as_deref().unwrap_or_default());
        if !api_key.is_empty() {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", api_key));
        }
        if let Some(extra) = &desc.headers {
            for (name, value) in extra {
                request = request.header(name.as_str(), expand_env(value));
            }
        }
    }

    let deadline = arm_deadline(&cancel, timeout);
    let send = request
        .header(header::CONTENT_TYPE, "application/json")
        .json(&payload)
        .send();

    let response = tokio::select! {
        result = send => result.map_err(|e| {
            if cancel.is_cancelled() {
                Error::Canceled
            } else {
                Error::internal(e)
            }
        }),
        _ = cancel.cancelled() => Err(Error::Canceled),
    };
    // Timer cleared as soon as the upstream call returns, success or error.
    deadline.abort();
    let response = response?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::UpstreamHttp {
            status: status.as_u16(),
            body,
        });
    }

    if stream {
        Ok(relay_stream(response, cancel))
    } else {
        let body = tokio::select! {
            bytes = response.bytes() => bytes.map_err(Error::from)?,
            _ = cancel.cancelled() => return Err(Error::Canceled),
        };
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| Error::Internal(format!("upstream sent invalid JSON: {}", e)))?;
        Ok((StatusCode::OK, axum::Json(value)).into_response())
    }
}

/// Copy upstream bytes to the client as server-sent events. The drop guard
/// inside the stream fires the cancel token when the client goes away, which
/// in turn stops the copy; an already-fired token (deadline) cuts it off too.
fn relay_stream(response: reqwest::Response, cancel: CancellationToken) -> Response {
    let guard = cancel.clone().drop_guard();
    let stopper = Box::pin(cancel.cancelled_owned());
    let bytes = response
        .bytes_stream()
        .take_until(stopper)
        .map(move |chunk| {
            let _client_alive = &guard;
            chunk.map_err(std::io::Error::other)
        });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(bytes))
        .expect("static headers are valid")
}
