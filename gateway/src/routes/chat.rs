//! Chat completions endpoint: the full request pipeline.
//!
//! route -> load -> budget -> rewrite -> proxy, with status events published
//! before the first proxied byte.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use lols_common::{ChatCompletionRequest, ChatMessage, PromptSource, StatusEvent};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::classify::RequestPlan;
use crate::context;
use crate::error::Result;
use crate::proxy;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/chat/completions", post(chat_completions))
}

/// POST /v1/chat/completions - OpenAI-compatible chat endpoint.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response> {
    let plan = state.router.plan(&req).await?;
    state.trace(format!(
        "routed {} -> {} (category: {})",
        req.model.as_deref().unwrap_or("<none>"),
        plan.model_id,
        plan.category.as_deref().unwrap_or("-")
    ));

    // Every request passes through the scheduler so resident transitions stay
    // sequentially consistent; a remote section is a constant-time marker
    // update. An in-flight client cancel does not interrupt this load.
    {
        let orchestrator = state.orchestrator.clone();
        let desc = plan.descriptor.clone();
        state
            .gpu
            .with_gpu(async move { orchestrator.ensure_loaded(&desc).await })
            .await?;
    }

    let outcome = context::fit_to_budget(req.messages.clone(), plan.descriptor.context);
    let dropped = outcome.dropped;

    let (mut messages, prompt, source) = inject_system_prompt(
        outcome.messages,
        &plan,
        state.flags.ignore_role_system(),
    );
    if dropped > 0 {
        insert_dropped_notice(&mut messages, dropped);
    }

    if let Some(category) = &plan.category {
        state.events.publish(StatusEvent::CategoryStatus {
            category: category.clone(),
            model_id: plan.model_id.clone(),
        });
        state.orchestrator.tag_category(&plan.model_id, category).await;
    }
    state.events.publish(StatusEvent::SystemPromptUsed {
        prompt: prompt.clone(),
        source,
    });

    let payload = build_payload(&req, &plan, messages);
    let timeout = proxy::request_timeout(&headers, &plan.descriptor);
    proxy::forward_chat(
        &state.http,
        &plan.descriptor,
        payload,
        timeout,
        CancellationToken::new(),
    )
    .await
}

/// Apply the system-prompt priority rules.
///
/// A leading client system message wins unless the process-wide
/// `ignoreRoleSystem` flag is on. Otherwise client system messages are
/// stripped and the category-level prompt, then the model-level prompt, is
/// injected at the front.
fn inject_system_prompt(
    messages: Vec<ChatMessage>,
    plan: &RequestPlan,
    ignore_role_system: bool,
) -> (Vec<ChatMessage>, Option<String>, PromptSource) {
    let leading_system = messages.first().map(ChatMessage::is_system).unwrap_or(false);

    if leading_system && !ignore_role_system {
        let text = messages[0].text();
        return (messages, Some(text), PromptSource::UserProvided);
    }

    let mut kept: Vec<ChatMessage> = messages.into_iter().filter(|m| !m.is_system()).collect();

    let category_prompt = plan
        .category_system_prompt
        .clone()
        .filter(|p| !p.trim().is_empty());
    if let Some(prompt) = category_prompt {
        kept.insert(0, ChatMessage::system(prompt.clone()));
        return (kept, Some(prompt), PromptSource::CategoryLevel);
    }

    let model_prompt = plan
        .descriptor
        .resolved_system_prompt()
        .filter(|p| !p.trim().is_empty());
    if let Some(prompt) = model_prompt {
        kept.insert(0, ChatMessage::system(prompt.clone()));
        return (kept, Some(prompt), PromptSource::ModelLevel);
    }

    (kept, None, PromptSource::None)
}

/// Place the truncation notice right after the leading system block, so the
/// prompt rules above never see it.
fn insert_dropped_notice(messages: &mut Vec<ChatMessage>, dropped: usize) {
    let idx = messages.iter().take_while(|m| m.is_system()).count();
    messages.insert(idx, context::dropped_notice(dropped));
}

/// The rewritten payload forwarded upstream. Interpreted fields are replaced;
/// everything the client sent beyond them rides along unchanged.
fn build_payload(
    req: &ChatCompletionRequest,
    plan: &RequestPlan,
    messages: Vec<ChatMessage>,
) -> Value {
    let max_tokens = context::resolve_max_tokens(
        req.max_tokens,
        req.n_predict,
        plan.descriptor.max_tokens,
    );
    let rewritten = ChatCompletionRequest {
        messages,
        model: Some(plan.model_id.clone()),
        stream: Some(req.stream()),
        max_tokens: Some(max_tokens),
        n_predict: None,
        temperature: req.temperature,
        top_p: req.top_p,
        tools: req.tools.clone(),
        extra: req.extra.clone(),
    };
    serde_json::to_value(rewritten).expect("request types serialize")
}
