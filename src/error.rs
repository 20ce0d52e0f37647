//! # Error Handling
//!
//! This module defines the error taxonomy of the processing pipeline and how
//! each kind is converted into an HTTP response.
//!
//! ## Error Categories:
//! - **Client faults (400)**: `MissingFile`, `InvalidSpeed`, `PayloadTooLarge`, `BadRequest`
//! - **Server faults (500)**: `Staging`, `Decode`, `Encode`, `Processing`, `ConfigError`
//!
//! None of them are retried. Every stage of the pipeline returns an
//! `AppResult<T>`, and the handler turns the first failure into exactly one
//! JSON response.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::InvalidSpeed("abc".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// The multipart body had no `file` field, or it was empty
    MissingFile,

    /// The `speed` field could not be parsed or is out of bounds
    InvalidSpeed(String),

    /// The upload exceeded the configured size limit (in bytes)
    PayloadTooLarge { limit_bytes: usize },

    /// Malformed multipart body or other unusable client input
    BadRequest(String),

    /// The filesystem rejected staging the upload (disk full, permissions)
    Staging(String),

    /// The staged file is unreadable, corrupt, or in an unsupported format
    Decode(String),

    /// The encoder could not produce the output file
    Encode(String),

    /// Any other internal failure (timeouts, resampler faults, worker panics)
    Processing(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl AppError {
    /// Machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::MissingFile => "missing_file",
            AppError::InvalidSpeed(_) => "invalid_speed",
            AppError::PayloadTooLarge { .. } => "payload_too_large",
            AppError::BadRequest(_) => "bad_request",
            AppError::Staging(_) => "staging_error",
            AppError::Decode(_) => "decode_error",
            AppError::Encode(_) => "encode_error",
            AppError::Processing(_) => "processing_error",
            AppError::ConfigError(_) => "config_error",
        }
    }

    /// Whether the failure was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::MissingFile
                | AppError::InvalidSpeed(_)
                | AppError::PayloadTooLarge { .. }
                | AppError::BadRequest(_)
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::MissingFile => write!(f, "No file uploaded"),
            AppError::InvalidSpeed(msg) => write!(f, "Invalid speed: {}", msg),
            AppError::PayloadTooLarge { limit_bytes } => {
                write!(f, "Upload exceeds the maximum size of {} bytes", limit_bytes)
            }
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Staging(msg) => write!(f, "Staging error: {}", msg),
            AppError::Decode(msg) => write!(f, "Decode error: {}", msg),
            AppError::Encode(msg) => write!(f, "Encode error: {}", msg),
            AppError::Processing(msg) => write!(f, "Processing error: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

/// Converts pipeline errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": "Invalid speed: 'abc' is not a number",
///   "kind": "invalid_speed",
///   "timestamp": "2025-01-01T12:00:00Z"
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    }
}

/// Untyped failures from helper code are treated as internal processing faults.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Processing(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Multipart parsing errors are almost always due to a malformed client body.
impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Multipart error: {}", err))
    }
}

/// A blocking job that panicked or was cancelled.
impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            AppError::Processing("processing worker panicked".to_string())
        } else {
            AppError::Processing(format!("processing worker failed: {}", err))
        }
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;
