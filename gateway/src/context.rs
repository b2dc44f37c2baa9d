//! Context budgeter.
//!
//! Trims a message history to a per-model token budget while keeping every
//! system message and the newest window of conversation. Token counts are
//! deliberately approximate; the 500-token margin absorbs the error.

use lols_common::ChatMessage;

/// Flat per-message overhead for role and structure.
pub const MESSAGE_OVERHEAD: u32 = 10;
/// Flat cost of one structured image part.
pub const IMAGE_TOKENS: u32 = 400;
/// Output headroom reserved out of every budget.
pub const OUTPUT_MARGIN: u32 = 500;
/// `max_tokens` used when neither request nor descriptor set one.
pub const DEFAULT_MAX_TOKENS: u32 = 2000;

/// Estimated token count for a text fragment: `ceil(ceil(len / 2.5) * 1.3)`.
pub fn estimate_text_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count() as f64;
    ((chars / 2.5).ceil() * 1.3).ceil() as u32
}

/// Estimated token cost of one message, overhead included.
pub fn estimate_message_tokens(msg: &ChatMessage) -> u32 {
    let images = msg
        .content
        .as_ref()
        .map(|c| c.image_count() as u32)
        .unwrap_or(0);
    MESSAGE_OVERHEAD + estimate_text_tokens(&msg.text()) + images * IMAGE_TOKENS
}

/// Result of fitting a history to a budget. The dropped-messages notice is
/// synthesized later by the pipeline, after system-prompt injection, so the
/// injection rules never see it.
#[derive(Debug)]
pub struct FitOutcome {
    pub messages: Vec<ChatMessage>,
    pub dropped: usize,
}

/// Fit `messages` to `budget` per the recency-window rule.
///
/// With no budget the input passes through untouched. Otherwise system
/// messages are all kept (in order, moved to the front), then non-system
/// messages are accepted newest-first until one no longer fits; acceptance
/// stops at the first overflow. Kept non-system messages stay in their
/// original relative order.
pub fn fit_to_budget(messages: Vec<ChatMessage>, budget: Option<u32>) -> FitOutcome {
    let Some(budget) = budget else {
        return FitOutcome { messages, dropped: 0 };
    };

    let (system, rest): (Vec<ChatMessage>, Vec<ChatMessage>) =
        messages.into_iter().partition(ChatMessage::is_system);

    let system_tokens: u32 = system.iter().map(estimate_message_tokens).sum();
    let mut available = budget
        .saturating_sub(system_tokens)
        .saturating_sub(OUTPUT_MARGIN);

    if available == 0 {
        let dropped = rest.len();
        return FitOutcome {
            messages: system,
            dropped,
        };
    }

    let total = rest.len();
    let mut kept_rev: Vec<ChatMessage> = Vec::new();
    for msg in rest.into_iter().rev() {
        let cost = estimate_message_tokens(&msg);
        if cost > available {
            break;
        }
        available -= cost;
        kept_rev.push(msg);
    }

    let dropped = total - kept_rev.len();
    let mut out = system;
    out.extend(kept_rev.into_iter().rev());
    FitOutcome {
        messages: out,
        dropped,
    }
}

/// The notice inserted in place of removed history.
pub fn dropped_notice(dropped: usize) -> ChatMessage {
    ChatMessage::system(format!(
        "Note: {} older message{} removed to fit the model's context window.",
        dropped,
        if dropped == 1 { " was" } else { "s were" }
    ))
}

/// Effective `max_tokens` for the forwarded request: the larger of what the
/// client asked for and what the model is configured to produce.
pub fn resolve_max_tokens(
    requested: Option<u32>,
    n_predict: Option<u32>,
    configured: Option<u32>,
) -> u32 {
    let requested = requested.or(n_predict).unwrap_or(0);
    let configured = configured.unwrap_or(DEFAULT_MAX_TOKENS);
    if requested > 0 {
        requested.max(configured)
    } else {
        configured
    }
}
