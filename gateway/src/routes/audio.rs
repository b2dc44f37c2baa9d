//! Audio transcription endpoint.
//!
//! Accepts an OpenAI-style multipart upload, makes sure the speech backend
//! owns the GPU (evicting any text model), and forwards the audio to its
//! `/inference` endpoint. The upload lives in a temp file for the duration of
//! one request; a periodic sweep catches anything a crash leaves behind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use lols_common::{TranscriptionResponse, VerboseTranscriptionResponse};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::proxy;
use crate::state::AppState;

/// Upload cap, per the OpenAI audio API.
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Accepted audio container extensions.
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "webm", "m4a", "flac"];

/// Temp files older than this are swept.
const STALE_UPLOAD_AGE: Duration = Duration::from_secs(60 * 60);
const UPLOAD_PREFIX: &str = "lols-audio-";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/audio/transcriptions", post(transcriptions))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024))
}

#[derive(Debug, Default)]
struct TranscriptionRequest {
    file_name: Option<String>,
    file_bytes: Option<bytes::Bytes>,
    model: Option<String>,
    language: Option<String>,
    prompt: Option<String>,
    temperature: Option<f32>,
    response_format: Option<String>,
}

/// Unlinks the upload on every exit path.
struct TempUpload {
    path: PathBuf,
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove temp upload {}: {}", self.path.display(), e);
            }
        }
    }
}

/// POST /v1/audio/transcriptions - multipart speech-to-text.
async fn transcriptions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response> {
    let req = parse_multipart(multipart).await?;

    let file_bytes = req
        .file_bytes
        .clone()
        .ok_or_else(|| Error::BadRequest("missing 'file' field".to_string()))?;
    if file_bytes.len() > MAX_UPLOAD_BYTES {
        return Err(Error::BadRequest(format!(
            "file exceeds {} MB limit",
            MAX_UPLOAD_BYTES / (1024 * 1024)
        )));
    }
    let extension = validated_extension(req.file_name.as_deref())?;

    // Resolve the speech descriptor: explicit model or the configured default.
    let desc = match &req.model {
        Some(id) => state
            .settings
            .descriptor(id)
            .ok_or_else(|| Error::UnknownModel(id.clone()))?,
        None => state.settings.speech_fallback().ok_or_else(|| {
            Error::BadRequest("no speech model configured".to_string())
        })?,
    };
    if desc.kind != lols_common::ModelKind::LocalSpeech {
        return Err(Error::BadRequest(format!(
            "model '{}' is not a speech model",
            desc.id
        )));
    }
    let desc = desc.clone();

    // Spool the upload; the guard unlinks it no matter how we exit.
    let temp_path = std::env::temp_dir().join(format!(
        "{}{}.{}",
        UPLOAD_PREFIX,
        uuid::Uuid::new_v4(),
        extension
    ));
    tokio::fs::write(&temp_path, &file_bytes).await?;
    let _upload = TempUpload {
        path: temp_path.clone(),
    };

    // Load the speech backend, evicting any resident text model.
    {
        let orchestrator = state.orchestrator.clone();
        let desc = desc.clone();
        state
            .gpu
            .with_gpu(async move { orchestrator.ensure_loaded(&desc).await })
            .await?;
    }

    let verbose = matches!(req.response_format.as_deref(), Some("verbose_json"));
    let port = desc.port.expect("speech descriptor validated at load");
    let url = format!("http://127.0.0.1:{}/inference", port);

    let mut form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(file_bytes.to_vec())
            .file_name(req.file_name.clone().unwrap_or_else(|| "audio".to_string())),
    );
    form = form.text(
        "response_format",
        if verbose { "verbose_json" } else { "json" },
    );
    if let Some(language) = &req.language {
        form = form.text("language", language.clone());
    }
    if let Some(prompt) = &req.prompt {
        form = form.text("prompt", prompt.clone());
    }
    if let Some(temperature) = req.temperature {
        form = form.text("temperature", temperature.to_string());
    }

    let timeout = proxy::request_timeout(&headers, &desc);
    let cancel = CancellationToken::new();
    let deadline = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };

    let send = state.http.post(&url).multipart(form).send();
    let response = tokio::select! {
        result = send => result.map_err(|e| {
            if cancel.is_cancelled() { Error::Canceled } else { Error::internal(e) }
        }),
        _ = cancel.cancelled() => Err(Error::Canceled),
    };
    deadline.abort();
    let response = response?;

    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(Error::UpstreamHttp {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    let upstream: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::Internal(format!("speech backend sent invalid JSON: {}", e)))?;

    if verbose {
        let verbose_body: VerboseTranscriptionResponse = serde_json::from_value(upstream)
            .map_err(|e| Error::Internal(format!("unexpected transcription shape: {}", e)))?;
        Ok(Json(verbose_body).into_response())
    } else {
        let text = upstream
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(Json(TranscriptionResponse { text }).into_response())
    }
}

async fn parse_multipart(mut multipart: Multipart) -> Result<TranscriptionRequest> {
    let mut out = TranscriptionRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(format!("invalid multipart payload: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                out.file_name = field.file_name().map(String::from);
                out.file_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| Error::BadRequest(format!("failed reading 'file': {}", e)))?,
                );
            }
            "model" => out.model = non_empty(read_text(field, "model").await?),
            "language" => out.language = non_empty(read_text(field, "language").await?),
            "prompt" => out.prompt = non_empty(read_text(field, "prompt").await?),
            "temperature" => {
                out.temperature = read_text(field, "temperature").await?.trim().parse().ok()
            }
            "response_format" => {
                let value = read_text(field, "response_format").await?;
                let value = value.trim();
                if !value.is_empty() {
                    if value != "json" && value != "verbose_json" {
                        return Err(Error::BadRequest(format!(
                            "unsupported response_format: {}",
                            value
                        )));
                    }
                    out.response_format = Some(value.to_string());
                }
            }
            _ => {}
        }
    }

    Ok(out)
}

async fn read_text(field: axum::extract::multipart::Field<'_>, name: &str) -> Result<String> {
    field
        .text()
        .await
        .map_err(|e| Error::BadRequest(format!("failed reading '{}': {}", name, e)))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn validated_extension(file_name: Option<&str>) -> Result<String> {
    let name = file_name.unwrap_or_default();
    let extension = name.rsplit('.').next().unwrap_or_default().to_lowercase();
    if AUDIO_EXTENSIONS.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(Error::BadRequest(format!(
            "unsupported media type: expected one of {}",
            AUDIO_EXTENSIONS.join(", ")
        )))
    }
}

/// Remove spooled uploads a crashed request left behind. Runs periodically
/// from a background task.
pub fn sweep_stale_uploads() -> usize {
    let dir = std::env::temp_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(UPLOAD_PREFIX) {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map(|age| age > STALE_UPLOAD_AGE)
            .unwrap_or(false);
        if stale && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

/// Interval of the background sweep task.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);
