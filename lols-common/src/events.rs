//! Status events broadcast to WebSocket observers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of backend serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    LocalText,
    LocalSpeech,
    RemoteHttp,
}

impl ModelKind {
    pub fn is_local(&self) -> bool {
        matches!(self, ModelKind::LocalText | ModelKind::LocalSpeech)
    }

    /// The `owned_by` label reported on `/v1/models`.
    pub fn owned_by(&self) -> &'static str {
        match self {
            ModelKind::LocalText => "llama-cpp",
            ModelKind::LocalSpeech => "whisper-cpp",
            ModelKind::RemoteHttp => "remote-api",
        }
    }
}

/// Where the effective system prompt of a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptSource {
    #[serde(rename = "user-provided")]
    UserProvided,
    #[serde(rename = "category-level")]
    CategoryLevel,
    #[serde(rename = "model-level")]
    ModelLevel,
    #[serde(rename = "none")]
    None,
}

/// Descriptor knobs included with a `modelStatus` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

/// One side-band event. Serialized as `{"type": "...", ...}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StatusEvent {
    /// Emitted on every resident-model mutation.
    #[serde(rename = "modelStatus", rename_all = "camelCase")]
    ModelStatus {
        model_id: Option<String>,
        kind: Option<ModelKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(flatten)]
        snapshot: ModelSnapshot,
    },
    /// Emitted after routing classifies a request.
    #[serde(rename = "categoryStatus", rename_all = "camelCase")]
    CategoryStatus { category: String, model_id: String },
    /// Emitted once the effective system prompt of a request is known.
    #[serde(rename = "systemPromptUsed")]
    SystemPromptUsed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        source: PromptSource,
    },
    /// GPU/host telemetry; the collector lives outside the gateway core, this
    /// variant only fixes the wire shape.
    #[serde(rename = "systemMetrics")]
    SystemMetrics { metrics: Value },
    /// Per-request trace line, published only while the logging toggle is on.
    #[serde(rename = "log")]
    Log { message: String },
}
