//! # HTTP Error Responses
//!
//! Converts library and configuration errors into JSON error bodies.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "connection_error",
//!     "message": "connection error: handshake timed out after 15000 ms",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//!
//! Session errors keep the library's machine-readable `code()` as their `type`, so a UI
//! can match on the same strings it sees in the error log.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;
use voice_session::VoiceError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A failed session operation, reported with its own error code.
    #[error(transparent)]
    Session(#[from] VoiceError),
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Session(err) => err.code(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Session(err) => match err {
                VoiceError::Configuration(_) | VoiceError::Format(_) => StatusCode::BAD_REQUEST,
                VoiceError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                VoiceError::DeviceUnavailable(_) | VoiceError::AudioDevice(_) => StatusCode::SERVICE_UNAVAILABLE,
                VoiceError::Connection(_) | VoiceError::ProviderSwitch { .. } => StatusCode::BAD_GATEWAY,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            AppError::Session(err) => err.to_string(),
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg) => msg.clone(),
        };
        let mut body = json!({
            "error": {
                "type": self.error_type(),
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        });
        if let AppError::Session(err) = self {
            body["error"]["recoverable"] = json!(err.is_recoverable());
        }
        HttpResponse::build(self.status_code()).json(body)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Validation failures surfaced through anyhow keep their 400.
        match err.downcast::<VoiceError>() {
            Ok(VoiceError::Configuration(msg)) => AppError::ValidationError(msg),
            Ok(other) => AppError::Session(other),
            Err(err) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}
