//! HTTP request logging middleware.
//!
//! Emits one tracing line per request and mirrors it onto the status channel
//! when the process-wide trace toggle is on.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::state::AppState;

pub async fn request_logger(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let status = response.status();
    let duration = start.elapsed();

    tracing::info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        "HTTP request"
    );
    state.trace(format!(
        "{} {} -> {} ({}ms)",
        method,
        path,
        status.as_u16(),
        duration.as_millis()
    ));

    response
}
