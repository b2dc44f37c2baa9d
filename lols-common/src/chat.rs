//! OpenAI-compatible chat completion wire types.
//!
//! The gateway is a proxy, so these types are deliberately lossless: fields it
//! does not interpret are kept as raw JSON and forwarded untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OpenAI-compatible chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// llama.cpp-native alias for `max_tokens`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_predict: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Tool definitions are opaque to the gateway and forwarded untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    /// Any other client fields pass through to the backend verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ChatCompletionRequest {
    pub fn stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// The newest user-role message, if any.
    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == "user")
    }

    /// Whether any message carries structured image content.
    pub fn has_image(&self) -> bool {
        self.messages.iter().any(ChatMessage::has_image)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }

    /// Flattened text of this message (see [`MessageContent::text`]).
    pub fn text(&self) -> String {
        self.content.as_ref().map(MessageContent::text).unwrap_or_default()
    }

    pub fn has_image(&self) -> bool {
        matches!(&self.content, Some(c) if c.has_image())
    }
}

/// A message body is either a plain string or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Normalize to plain text: string content as-is, part lists joined from
    /// their `text` parts with newlines. Image and unknown parts contribute
    /// nothing. Everything that needs message text goes through here.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_image(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts.iter().any(ContentPart::is_image),
        }
    }

    /// Number of image parts, used for token estimation.
    pub fn image_count(&self) -> usize {
        match self {
            MessageContent::Text(_) => 0,
            MessageContent::Parts(parts) => parts.iter().filter(|p| p.is_image()).count(),
        }
    }
}

/// One entry of a structured content list. Unknown part types are carried in
/// `extra` so forwarding stays lossless, but normalization ignores them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ContentPart {
    pub fn is_image(&self) -> bool {
        self.kind == "image_url" || self.kind == "image"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_minimal() {
        let json = r#"{"messages": [{"role": "user", "content": "Hello"}]}"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert!(req.model.is_none());
        assert!(!req.stream());
    }

    #[test]
    fn test_request_unknown_fields_survive_roundtrip() {
        let json = r#"{
            "messages": [{"role": "user", "content": "hi"}],
            "model": "m",
            "response_format": {"type": "json_object"},
            "seed": 7
        }"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.extra.len(), 2);

        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out["seed"], 7);
        assert_eq!(out["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_string_content_text() {
        let msg = ChatMessage::user("What is 2+2?");
        assert_eq!(msg.text(), "What is 2+2?");
        assert!(!msg.has_image());
    }

    #[test]
    fn test_parts_content_text_joined() {
        let json = r#"{
            "role": "user",
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,XYZ"}},
                {"type": "text", "text": "second"}
            ]
        }"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.text(), "first\nsecond");
        assert!(msg.has_image());
    }

    #[test]
    fn test_image_variant_detected() {
        let json = r#"{"role": "user", "content": [{"type": "image", "data": "abc"}]}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert!(msg.has_image());
        assert_eq!(msg.content.unwrap().image_count(), 1);
    }

    #[test]
    fn test_unknown_part_type_ignored() {
        let json = r#"{
            "role": "user",
            "content": [
                {"type": "input_audio", "input_audio": {"data": "zzz"}},
                {"type": "text", "text": "hello"}
            ]
        }"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.text(), "hello");
        assert!(!msg.has_image());
    }

    #[test]
    fn test_last_user_message() {
        let req = ChatCompletionRequest {
            messages: vec![
                ChatMessage::system("sys"),
                ChatMessage::user("one"),
                ChatMessage {
                    role: "assistant".to_string(),
                    content: Some(MessageContent::Text("reply".to_string())),
                    tool_calls: None,
                    tool_call_id: None,
                },
                ChatMessage::user("two"),
            ],
            model: None,
            stream: None,
            max_tokens: None,
            n_predict: None,
            temperature: None,
            top_p: None,
            tools: None,
            extra: BTreeMap::new(),
        };
        assert_eq!(req.last_user_message().unwrap().text(), "two");
    }

    #[test]
    fn test_tool_calls_are_opaque() {
        let json = r#"{
            "role": "assistant",
            "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{}", "vendor_field": 1}}]
        }"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["tool_calls"][0]["function"]["vendor_field"], 1);
    }
}
