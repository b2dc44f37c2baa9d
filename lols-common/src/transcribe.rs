//! Transcription response wire types (OpenAI audio API subset).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `response_format=json` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
}

/// `response_format=verbose_json` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerboseTranscriptionResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<TranscriptionSegment>>,
}

/// One timed segment as reported by the speech backend. Extra backend fields
/// are tolerated and dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub start: Option<Value>,
    #[serde(default)]
    pub end: Option<Value>,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_parses_whisper_segments() {
        let json = r#"{
            "text": "hello world",
            "language": "en",
            "duration": 1.5,
            "segments": [
                {"id": 0, "start": "00:00:00,000", "end": "00:00:01,500", "text": "hello world", "tokens": [1, 2]}
            ]
        }"#;
        let resp: VerboseTranscriptionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.text, "hello world");
        assert_eq!(resp.segments.unwrap().len(), 1);
    }

    #[test]
    fn test_plain_response() {
        let resp: TranscriptionResponse = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert_eq!(resp.text, "hi");
    }
}
