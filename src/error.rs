//! # Error Handling
//!
//! HTTP-facing error type plus its conversion into JSON responses. The real-time
//! side of the relay never returns these to a WebSocket client; connection-level
//! failures are expressed as outbound protocol messages instead (see `protocol`).
//!
//! ## Error Categories:
//! - **BadRequest**: Client sent invalid data (400 errors)
//! - **ValidationError**: Data validation failed (400 errors)
//! - **Unavailable**: The room code space is exhausted (503 errors)

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use crate::rooms::RoomError;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::ValidationError("Room code must be 5 digits".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    ValidationError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Room code must be exactly 5 digits",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<RoomError> for AppError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::InvalidCode(_) => AppError::ValidationError(err.to_string()),
            RoomError::AlreadyExists(_) => AppError::BadRequest(err.to_string()),
            RoomError::CodeSpaceExhausted => AppError::Unavailable(err.to_string()),
        }
    }
}

/// Shorthand for `Result<T, AppError>` in HTTP handlers.
pub type AppResult<T> = Result<T, AppError>;
