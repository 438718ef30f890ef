//! Error type shared by the sandbox, the orchestrator and the HTTP layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DevError {
    #[error("sandbox is not booted")]
    NotBooted,
    #[error("sandbox error: {0}")]
    Sandbox(String),
    #[error("invalid sandbox path '{0}'")]
    InvalidPath(String),
    #[error("failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },
    #[error("process input is closed")]
    ProcessClosed,
    #[error("installation failed with exit code {code}")]
    InstallFailed { code: i32 },
    #[error("sandbox event channel closed before the server became ready")]
    ReadyChannelClosed,
    #[error("setup failed: {0}")]
    SetupFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for DevError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            DevError::NotBooted => (StatusCode::SERVICE_UNAVAILABLE, "not_booted"),
            DevError::InvalidPath(_) => (StatusCode::BAD_REQUEST, "invalid_path"),
            DevError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            DevError::InstallFailed { .. } | DevError::SetupFailed(_) => {
                (StatusCode::BAD_GATEWAY, "setup_failed")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorBody {
            code: code.to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type DevResult<T> = Result<T, DevError>;
