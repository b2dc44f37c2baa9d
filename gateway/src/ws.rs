//! WebSocket fan-out of status events.
//!
//! Any connection to `/` may upgrade; each subscriber gets an immediate
//! `modelStatus` snapshot, then events in publish order. A subscriber that
//! falls behind loses the oldest events instead of stalling publishers.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::state::AppState;

/// GET / - WebSocket upgrade for observers; a plain GET gets a liveness body.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(upgrade) => upgrade.on_upgrade(move |socket| handle_observer(socket, state)),
        None => axum::Json(serde_json::json!({ "service": "lols-gateway" })).into_response(),
    }
}

async fn handle_observer(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Snapshot first, so a fresh UI renders the resident model immediately.
    let snapshot = state.orchestrator.model_status_event().await;
    if send_event(&mut ws_tx, &snapshot).await.is_err() {
        return;
    }

    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut ws_tx, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!("Observer lagged, {} events dropped", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Observers have nothing to tell us.
                    Some(Err(e)) => {
                        tracing::debug!("Observer socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

async fn send_event<S>(sink: &mut S, event: &lols_common::StatusEvent) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = serde_json::to_string(event).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}
