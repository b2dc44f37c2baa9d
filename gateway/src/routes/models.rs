//! Model listing endpoint (OpenAI-compatible).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::config::CLASSIFIER_ALIAS;
use crate::state::AppState;

/// Label for the classifier-alias pseudo-model.
const ROUTER_OWNER: &str = "lols-router";

#[derive(Debug, Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
struct ModelEntry {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/models", get(list_models))
}

/// GET /v1/models - all configured models, plus the classifier alias when
/// category routing is configured.
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let mut data: Vec<ModelEntry> = state
        .settings
        .models
        .values()
        .map(|desc| ModelEntry {
            id: desc.id.clone(),
            object: "model",
            created: state.started_at,
            owned_by: desc.kind.owned_by().to_string(),
        })
        .collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));

    if state.router.alias_configured() {
        data.push(ModelEntry {
            id: CLASSIFIER_ALIAS.to_string(),
            object: "model",
            created: state.started_at,
            owned_by: ROUTER_OWNER.to_string(),
        });
    }

    Json(ModelList {
        object: "list",
        data,
    })
}
