//! LOLS Common Types
//!
//! Shared types used by the gateway and its WebSocket observers.

pub mod chat;
pub mod events;
pub mod transcribe;

pub use chat::{ChatCompletionRequest, ChatMessage, ContentPart, MessageContent};
pub use events::{ModelKind, ModelSnapshot, PromptSource, StatusEvent};
pub use transcribe::{TranscriptionResponse, TranscriptionSegment, VerboseTranscriptionResponse};
