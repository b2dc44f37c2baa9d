//! Classification-based request router.
//!
//! Maps a chat request to a target model: explicit model names resolve
//! directly, the classifier alias consults structural signals (images) and a
//! permanently resident small classifier backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lols_common::{ChatCompletionRequest, ChatMessage};
use serde::Deserialize;
use serde_json::json;

use crate::config::{ModelDescriptor, Settings, CLASSIFIER_ALIAS, DEFAULT_CATEGORY};
use crate::error::{Error, Result};
use crate::state::Flags;

/// Category forced when a request carries image content.
pub const VISION_CATEGORY: &str = "vision";

/// Deadline on one classifier call; failures fall back to `default`.
const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(5);
const CLASSIFY_MAX_TOKENS: u32 = 10;
const CLASSIFY_TEMPERATURE: f32 = 0.1;

/// Routing decision for one request.
#[derive(Debug, Clone)]
pub struct RequestPlan {
    pub model_id: String,
    pub descriptor: ModelDescriptor,
    pub category: Option<String>,
    pub category_system_prompt: Option<String>,
}

pub struct Router {
    settings: Arc<Settings>,
    flags: Arc<Flags>,
    http: reqwest::Client,
    /// Set once the classifier backend comes up at boot. When it never does,
    /// routing degrades to the `default` category.
    classifier_up: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    choices: Vec<ClassifierChoice>,
}

#[derive(Debug, Deserialize)]
struct ClassifierChoice {
    message: ClassifierMessage,
}

#[derive(Debug, Deserialize)]
struct ClassifierMessage {
    #[serde(default)]
    content: Option<String>,
}

impl Router {
    pub fn new(settings: Arc<Settings>, flags: Arc<Flags>) -> Self {
        Self {
            settings,
            flags,
            http: reqwest::Client::new(),
            classifier_up: AtomicBool::new(false),
        }
    }

    pub fn set_classifier_up(&self, up: bool) {
        self.classifier_up.store(up, Ordering::Relaxed);
    }

    pub fn classifier_up(&self) -> bool {
        self.classifier_up.load(Ordering::Relaxed)
    }

    /// Build the routing plan for a chat request.
    pub async fn plan(&self, req: &ChatCompletionRequest) -> Result<RequestPlan> {
        // Debug pin wins over everything.
        if let Some(pinned) = self.flags.test_model() {
            let descriptor = self.lookup(&pinned)?;
            return Ok(RequestPlan {
                model_id: pinned,
                descriptor,
                category: None,
                category_system_prompt: None,
            });
        }

        // Explicitly named model (anything but the alias) resolves directly.
        match req.model.as_deref() {
            Some(model) if model != CLASSIFIER_ALIAS => {
                let descriptor = self.lookup(model)?;
                return Ok(RequestPlan {
                    model_id: model.to_string(),
                    descriptor,
                    category: None,
                    category_system_prompt: None,
                });
            }
            _ => {}
        }

        let category = self.categorize(req).await;
        self.resolve_category(category)
    }

    /// Pick a category for an alias-routed request.
    async fn categorize(&self, req: &ChatCompletionRequest) -> String {
        // Structural override: image content always routes to vision, the
        // classifier is not consulted.
        if req.has_image() {
            return VISION_CATEGORY.to_string();
        }

        let last_user = req
            .last_user_message()
            .map(ChatMessage::text)
            .unwrap_or_default();
        if last_user.is_empty() {
            return DEFAULT_CATEGORY.to_string();
        }

        if !self.classifier_up() {
            return DEFAULT_CATEGORY.to_string();
        }

        match self.call_classifier(&last_user).await {
            Some(answer) => {
                let answer = answer.trim().to_lowercase();
                if self.settings.categories.contains_key(&answer) {
                    answer
                } else {
                    tracing::debug!("Classifier answered unknown category '{}'", answer);
                    DEFAULT_CATEGORY.to_string()
                }
            }
            None => DEFAULT_CATEGORY.to_string(),
        }
    }

    /// One classifier round trip. Any failure (timeout, bad status, malformed
    /// body) is reported as `None` and absorbed by the caller.
    async fn call_classifier(&self, last_user_text: &str) -> Option<String> {
        let router = self.settings.router.as_ref()?;
        let system = self.classifier_system_prompt()?;

        let url = format!("http://127.0.0.1:{}/v1/chat/completions", router.port);
        let body = json!({
            "model": router.model_id,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": last_user_text},
            ],
            "max_tokens": CLASSIFY_MAX_TOKENS,
            "temperature": CLASSIFY_TEMPERATURE,
            "stream": false,
        });

        let resp = self
            .http
            .post(&url)
            .timeout(CLASSIFY_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| tracing::debug!("Classifier call failed: {}", e))
            .ok()?;

        if !resp.status().is_success() {
            tracing::debug!("Classifier returned {}", resp.status());
            return None;
        }

        let parsed: ClassifierResponse = resp
            .json()
            .await
            .map_err(|e| tracing::debug!("Classifier body unparsable: {}", e))
            .ok()?;
        parsed.choices.into_iter().next()?.message.content
    }

    /// The classifier system prompt with `{CATEGORIES}` expanded to the
    /// configured category keys.
    fn classifier_system_prompt(&self) -> Option<String> {
        let router = self.settings.router.as_ref()?;
        let template = router.prompt_template()?;
        let mut keys: Vec<&str> = self.settings.categories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        Some(template.replace("{CATEGORIES}", &keys.join(", ")))
    }

    /// Resolve a category to its bound model and optional prompt.
    fn resolve_category(&self, category: String) -> Result<RequestPlan> {
        let binding = self
            .settings
            .categories
            .get(&category)
            .or_else(|| self.settings.categories.get(DEFAULT_CATEGORY))
            .ok_or_else(|| {
                Error::ConfigInvalid(format!(
                    "no binding for category '{}' and no default binding",
                    category
                ))
            })?;

        let model_id = binding.model_id().to_string();
        let descriptor = self.lookup(&model_id)?;
        Ok(RequestPlan {
            model_id,
            descriptor,
            category: Some(category),
            category_system_prompt: binding.resolved_system_prompt(),
        })
    }

    fn lookup(&self, model_id: &str) -> Result<ModelDescriptor> {
        self.settings
            .descriptor(model_id)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(model_id.to_string()))
    }

    /// Binding map for `/v1/models`: the alias entry is listed iff any
    /// category bindings exist.
    pub fn alias_configured(&self) -> bool {
        !self.settings.categories.is_empty()
    }
}
