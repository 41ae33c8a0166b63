use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::error::SessionError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - session may have expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Fields that carry a human-readable message, in lookup order.
/// `username`, `password` and `password_confirm` hold field validation
/// errors from the registration endpoint as arrays of strings.
const MESSAGE_FIELDS: [&str; 5] = ["detail", "status", "username", "password", "password_confirm"];

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = backend_message(body).unwrap_or_else(|| Self::truncate_body(body));
        match status.as_u16() {
            400 | 409 | 422 => ApiError::Rejected(message),
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// True when the session is gone and the user must log in again.
    pub fn requires_login(&self) -> bool {
        match self {
            ApiError::Unauthorized => true,
            ApiError::Session(e) => e.is_terminal_auth(),
            _ => false,
        }
    }
}

/// Extract the backend's own message from an error body, if there is one.
pub fn backend_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let object = value.as_object()?;

    MESSAGE_FIELDS.iter().find_map(|field| match object.get(*field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => items.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    })
}
