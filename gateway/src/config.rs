//! Gateway configuration: model descriptors, category bindings, router setup.
//!
//! Everything here is loaded once at startup from a JSON file (plus
//! `LOLS__SECTION__KEY` environment overrides) and is read-only afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Config as ConfigLoader, ConfigError as ConfigCrateError, Environment, File, FileFormat};
use lols_common::ModelKind;
use serde::Deserialize;

/// Virtual model name that triggers classifier-based routing.
pub const CLASSIFIER_ALIAS: &str = "lols-smart";

/// Fallback category when classification is unavailable or inconclusive.
pub const DEFAULT_CATEGORY: &str = "default";

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// When false, backends are spawned CPU-only.
    #[serde(default = "default_true")]
    pub gpu: bool,
    /// Device passed to the text backend when GPU is enabled (e.g. "CUDA0").
    #[serde(default)]
    pub gpu_device: Option<String>,
    #[serde(default = "default_llama_server_bin")]
    pub llama_server_bin: String,
    #[serde(default = "default_whisper_server_bin")]
    pub whisper_server_bin: String,
    /// Model id -> descriptor. `llama-models` is the legacy key for the same map.
    #[serde(default, alias = "llama-models")]
    pub models: HashMap<String, ModelDescriptor>,
    /// Classifier category -> model binding.
    #[serde(default)]
    pub categories: HashMap<String, CategoryBinding>,
    #[serde(default)]
    pub router: Option<RouterSettings>,
    /// When true, system-role messages sent by clients are stripped.
    #[serde(default)]
    pub ignore_role_system: bool,
    /// Speech model used when a transcription request names none.
    #[serde(default)]
    pub default_speech_model: Option<String>,
}

/// Immutable configuration entry for one model.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    /// Map key, injected after deserialization.
    #[serde(skip)]
    pub id: String,
    pub kind: ModelKind,
    #[serde(default)]
    pub port: Option<u16>,

    // local_text
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    /// Vision projector file.
    #[serde(default)]
    pub mmproj: Option<String>,
    /// Input token budget enforced by the context budgeter.
    #[serde(default)]
    pub context: Option<u32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Per-request upstream timeout, seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub min_p: Option<f32>,
    #[serde(default)]
    pub repeat_penalty: Option<f32>,
    #[serde(default)]
    pub performance: Option<PerformanceSettings>,

    // local_speech
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub threads: Option<u32>,

    // remote_http
    #[serde(default)]
    pub endpoint: Option<String>,
    /// May reference an environment variable as `${NAME}`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Upstream model name substituted into forwarded payloads.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,

    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub system_prompt_path: Option<String>,
}

impl ModelDescriptor {
    pub fn is_local(&self) -> bool {
        self.kind.is_local()
    }

    /// The system prompt configured on the model itself: file contents win
    /// over the inline string. Read failures degrade to the inline value.
    pub fn resolved_system_prompt(&self) -> Option<String> {
        if let Some(path) = &self.system_prompt_path {
            match std::fs::read_to_string(expand_home(path)) {
                Ok(text) => return Some(text.trim_end().to_string()),
                Err(e) => {
                    tracing::warn!("Failed to read system prompt file {}: {}", path, e);
                }
            }
        }
        self.system_prompt.clone()
    }

    /// Per-request upstream timeout in seconds, after defaulting.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(crate::proxy::DEFAULT_TIMEOUT_SECS)
    }
}

/// Backend spawn-time performance knobs, passed through to llama-server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSettings {
    #[serde(default)]
    pub flash_attention: Option<bool>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub ubatch_size: Option<u32>,
    #[serde(default)]
    pub threads: Option<u32>,
    /// Parallel server slots.
    #[serde(default)]
    pub parallel: Option<u32>,
    #[serde(default)]
    pub cont_batching: Option<bool>,
    #[serde(default)]
    pub cache_type_k: Option<String>,
    #[serde(default)]
    pub cache_type_v: Option<String>,
}

/// Binding from a classifier category to a model, either a bare id or a
/// record with an optional category-level system prompt.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CategoryBinding {
    Id(String),
    #[serde(rename_all = "camelCase")]
    Full {
        model_id: String,
        #[serde(default)]
        system_prompt: Option<String>,
        #[serde(default)]
        system_prompt_path: Option<String>,
    },
}

impl CategoryBinding {
    pub fn model_id(&self) -> &str {
        match self {
            CategoryBinding::Id(id) => id,
            CategoryBinding::Full { model_id, .. } => model_id,
        }
    }

    /// Category-level prompt: file contents win over the inline string.
    pub fn resolved_system_prompt(&self) -> Option<String> {
        match self {
            CategoryBinding::Id(_) => None,
            CategoryBinding::Full {
                system_prompt,
                system_prompt_path,
                ..
            } => {
                if let Some(path) = system_prompt_path {
                    match std::fs::read_to_string(expand_home(path)) {
                        Ok(text) => return Some(text.trim_end().to_string()),
                        Err(e) => {
                            tracing::warn!("Failed to read category prompt file {}: {}", path, e);
                        }
                    }
                }
                system_prompt.clone()
            }
        }
    }
}

/// Classifier backend configuration. Its prompt must contain the literal
/// `{CATEGORIES}` token, expanded at runtime to the configured category keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterSettings {
    pub model_id: String,
    pub port: u16,
    #[serde(default)]
    pub context: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub system_prompt_path: Option<String>,
}

impl RouterSettings {
    /// The classifier system prompt template, before `{CATEGORIES}` expansion.
    pub fn prompt_template(&self) -> Option<String> {
        if let Some(path) = &self.system_prompt_path {
            match std::fs::read_to_string(expand_home(path)) {
                Ok(text) => return Some(text),
                Err(e) => {
                    tracing::warn!("Failed to read router prompt file {}: {}", path, e);
                }
            }
        }
        self.system_prompt.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigCrateError> for ConfigError {
    fn from(err: ConfigCrateError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

// Defaults
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_llama_server_bin() -> String {
    "llama-server".to_string()
}
fn default_whisper_server_bin() -> String {
    "whisper-server".to_string()
}
fn default_true() -> bool {
    true
}

impl Settings {
    /// Load from a JSON file plus `LOLS__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let loaded = ConfigLoader::builder()
            .add_source(File::new(path, FileFormat::Json).required(true))
            .add_source(
                Environment::with_prefix("LOLS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = loaded.try_deserialize().map_err(ConfigError::from)?;
        settings.finish()
    }

    /// Inject map keys as descriptor ids and validate cross-field invariants.
    pub fn finish(mut self) -> Result<Self, ConfigError> {
        let mut seen_ports: HashMap<u16, String> = HashMap::new();

        for (id, desc) in self.models.iter_mut() {
            desc.id = id.clone();

            match desc.kind {
                ModelKind::LocalText => {
                    let port = desc.port.ok_or_else(|| {
                        ConfigError::Invalid(format!("model '{}' has no port", id))
                    })?;
                    if let Some(other) = seen_ports.insert(port, id.clone()) {
                        return Err(ConfigError::Invalid(format!(
                            "models '{}' and '{}' share port {}",
                            other, id, port
                        )));
                    }
                    if desc.repo.is_none() && desc.file.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "model '{}' needs a repo or a file",
                            id
                        )));
                    }
                }
                ModelKind::LocalSpeech => {
                    let port = desc.port.ok_or_else(|| {
                        ConfigError::Invalid(format!("model '{}' has no port", id))
                    })?;
                    if let Some(other) = seen_ports.insert(port, id.clone()) {
                        return Err(ConfigError::Invalid(format!(
                            "models '{}' and '{}' share port {}",
                            other, id, port
                        )));
                    }
                    if desc.file.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "speech model '{}' needs a file",
                            id
                        )));
                    }
                }
                ModelKind::RemoteHttp => {
                    if desc.endpoint.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "remote model '{}' needs an endpoint",
                            id
                        )));
                    }
                    if desc.model.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "remote model '{}' needs an upstream model name",
                            id
                        )));
                    }
                }
            }
        }

        for (category, binding) in &self.categories {
            if !self.models.contains_key(binding.model_id()) {
                return Err(ConfigError::Invalid(format!(
                    "category '{}' binds unknown model '{}'",
                    category,
                    binding.model_id()
                )));
            }
        }

        if let Some(router) = &self.router {
            match self.models.get(&router.model_id) {
                Some(desc) if desc.kind == ModelKind::LocalText => {}
                Some(_) => {
                    return Err(ConfigError::Invalid(format!(
                        "router model '{}' must be local_text",
                        router.model_id
                    )))
                }
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "router binds unknown model '{}'",
                        router.model_id
                    )))
                }
            }
        }

        Ok(self)
    }

    pub fn descriptor(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.get(id)
    }

    /// All ports local backends are configured to use, classifier included.
    pub fn local_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .models
            .values()
            .filter(|d| d.is_local())
            .filter_map(|d| d.port)
            .collect();
        if let Some(router) = &self.router {
            ports.push(router.port);
        }
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// The speech descriptor a bare transcription request falls back to.
    pub fn speech_fallback(&self) -> Option<&ModelDescriptor> {
        if let Some(id) = &self.default_speech_model {
            return self.models.get(id);
        }
        let mut speech: Vec<&ModelDescriptor> = self
            .models
            .values()
            .filter(|d| d.kind == ModelKind::LocalSpeech)
            .collect();
        speech.sort_by(|a, b| a.id.cmp(&b.id));
        speech.into_iter().next()
    }
}

/// Substitute `${NAME}` patterns against the process environment. Unresolved
/// placeholders stay literal.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    Path::new(path).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_model(port: u16) -> ModelDescriptor {
        serde_json::from_value(serde_json::json!({
            "kind": "local_text",
            "port": port,
            "file": "/models/m.gguf"
        }))
        .unwrap()
    }

    #[test]
    fn test_descriptor_kinds_parse() {
        let json = serde_json::json!({
            "models": {
                "coder": {
                    "kind": "local_text",
                    "port": 8085,
                    "repo": "org/coder-gguf",
                    "file": "coder-q4_k_m.gguf",
                    "context": 16384,
                    "maxTokens": 4000,
                    "performance": {"flashAttention": true, "batchSize": 2048}
                },
                "scribe": {
                    "kind": "local_speech",
                    "port": 8086,
                    "file": "/models/ggml-base.bin",
                    "language": "auto",
                    "threads": 8
                },
                "cloud": {
                    "kind": "remote_http",
                    "endpoint": "https://api.example.com/v1/chat/completions",
                    "apiKey": "${EXAMPLE_KEY}",
                    "model": "big-cloud-model"
                }
            }
        });
        let settings: Settings = serde_json::from_value(json).unwrap();
        let settings = settings.finish().unwrap();

        let coder = settings.descriptor("coder").unwrap();
        assert_eq!(coder.id, "coder");
        assert_eq!(coder.kind, ModelKind::LocalText);
        assert_eq!(coder.context, Some(16384));
        assert_eq!(
            coder.performance.as_ref().unwrap().flash_attention,
            Some(true)
        );

        let scribe = settings.descriptor("scribe").unwrap();
        assert_eq!(scribe.kind, ModelKind::LocalSpeech);
        assert_eq!(scribe.threads, Some(8));

        let cloud = settings.descriptor("cloud").unwrap();
        assert_eq!(cloud.kind, ModelKind::RemoteHttp);
        assert!(cloud.port.is_none());
    }

    #[test]
    fn test_legacy_models_key_accepted() {
        let json = serde_json::json!({
            "llama-models": {
                "m": {"kind": "local_text", "port": 9000, "file": "/m.gguf"}
            }
        });
        let settings: Settings = serde_json::from_value(json).unwrap();
        assert!(settings.models.contains_key("m"));
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let mut settings: Settings = serde_json::from_value(serde_json::json!({})).unwrap();
        settings.models.insert("a".to_string(), text_model(9000));
        settings.models.insert("b".to_string(), text_model(9000));
        assert!(matches!(settings.finish(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_local_text_requires_port() {
        let json = serde_json::json!({
            "models": {"m": {"kind": "local_text", "file": "/m.gguf"}}
        });
        let settings: Settings = serde_json::from_value(json).unwrap();
        assert!(settings.finish().is_err());
    }

    #[test]
    fn test_category_binding_forms() {
        let bare: CategoryBinding = serde_json::from_value(serde_json::json!("coder")).unwrap();
        assert_eq!(bare.model_id(), "coder");
        assert!(bare.resolved_system_prompt().is_none());

        let full: CategoryBinding = serde_json::from_value(serde_json::json!({
            "modelId": "coder",
            "systemPrompt": "You are a coder."
        }))
        .unwrap();
        assert_eq!(full.model_id(), "coder");
        assert_eq!(
            full.resolved_system_prompt().as_deref(),
            Some("You are a coder.")
        );
    }

    #[test]
    fn test_category_binding_unknown_model_rejected() {
        let json = serde_json::json!({
            "models": {"m": {"kind": "local_text", "port": 9000, "file": "/m.gguf"}},
            "categories": {"code": "missing"}
        });
        let settings: Settings = serde_json::from_value(json).unwrap();
        assert!(settings.finish().is_err());
    }

    #[test]
    fn test_expand_env_resolves_and_keeps_unknown() {
        std::env::set_var("LOLS_TEST_TOKEN", "sekrit");
        assert_eq!(
            expand_env("Bearer ${LOLS_TEST_TOKEN}/x"),
            "Bearer sekrit/x"
        );
        assert_eq!(
            expand_env("${LOLS_TEST_NOPE_XYZ}"),
            "${LOLS_TEST_NOPE_XYZ}"
        );
        assert_eq!(expand_env("no placeholders"), "no placeholders");
        // Unterminated pattern stays literal.
        assert_eq!(expand_env("half ${open"), "half ${open");
    }

    #[test]
    fn test_expand_home() {
        let expanded = expand_home("~/models/x.gguf");
        assert!(!expanded.to_string_lossy().starts_with("~/"));
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn test_local_ports_include_router() {
        let json = serde_json::json!({
            "models": {
                "m": {"kind": "local_text", "port": 9000, "file": "/m.gguf"},
                "r": {"kind": "local_text", "port": 9100, "file": "/r.gguf"}
            },
            "router": {"modelId": "r", "port": 3001}
        });
        let settings: Settings = serde_json::from_value(json).unwrap();
        let settings = settings.finish().unwrap();
        assert_eq!(settings.local_ports(), vec![3001, 9000, 9100]);
    }

    #[test]
    fn test_speech_fallback_prefers_configured_default() {
        let json = serde_json::json!({
            "models": {
                "a-speech": {"kind": "local_speech", "port": 9001, "file": "/a.bin"},
                "b-speech": {"kind": "local_speech", "port": 9002, "file": "/b.bin"}
            },
            "defaultSpeechModel": "b-speech"
        });
        let settings: Settings = serde_json::from_value(json).unwrap();
        let settings = settings.finish().unwrap();
        assert_eq!(settings.speech_fallback().unwrap().id, "b-speech");
    }
}
