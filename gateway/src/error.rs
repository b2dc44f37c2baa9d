//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// How much upstream body is echoed back on a 502.
const UPSTREAM_BODY_PREVIEW: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("GPU task exceeded {0} seconds")]
    GpuTimeout(u64),

    #[error("Backend on port {port} not ready within {waited_secs}s")]
    ColdStartTimeout { port: u16, waited_secs: u64 },

    #[error("Upstream returned {status}")]
    UpstreamHttp { status: u16, body: String },

    #[error("Request canceled")]
    Canceled,

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::UnknownModel(_) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),

            Error::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": { "message": message, "type": "invalid_request_error" }
                })),
            )
                .into_response(),

            Error::UpstreamHttp { status, body } => {
                let preview: String = body.chars().take(UPSTREAM_BODY_PREVIEW).collect();
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({
                        "error": {
                            "message": "upstream backend error",
                            "upstream_status": status,
                            "upstream_body": preview,
                        }
                    })),
                )
                    .into_response()
            }

            // The client is gone; the status is never observed.
            Error::Canceled => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),

            Error::ConfigInvalid(_)
            | Error::GpuTimeout(_)
            | Error::ColdStartTimeout { .. }
            | Error::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
