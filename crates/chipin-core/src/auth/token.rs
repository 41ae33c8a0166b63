//! Display-claims extraction from compact signed tokens.
//!
//! Only the payload segment is decoded. Signatures are not checked here:
//! the backend decides whether a token is valid, and the client finds out
//! when a request is rejected.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Claim holding the numeric user identifier.
const USER_ID_CLAIM: &str = "user_id";

/// Claim holding the login name.
const USERNAME_CLAIM: &str = "username";

/// Identity fields decoded from the active access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub username: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedTokenError {
    #[error("expected 3 dot-separated segments, found {0}")]
    SegmentCount(usize),

    #[error("payload segment is empty")]
    EmptyPayload,

    #[error("payload is not valid base64url: {0}")]
    Base64(String),

    #[error("payload is not valid JSON: {0}")]
    Json(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload has no integer `user_id` claim")]
    MissingUserId,

    #[error("payload has no string `username` claim")]
    MissingUsername,
}

/// Decode the claims carried by an access token.
pub fn decode(token: &str) -> Result<Claims, MalformedTokenError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(MalformedTokenError::SegmentCount(segments.len()));
    }

    // Some issuers pad the segment even though the compact form forbids it
    let payload = segments[1].trim_end_matches('=');
    if payload.is_empty() {
        return Err(MalformedTokenError::EmptyPayload);
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| MalformedTokenError::Base64(e.to_string()))?;

    let value: Value =
        serde_json::from_slice(&bytes).map_err(|e| MalformedTokenError::Json(e.to_string()))?;
    let object = value.as_object().ok_or(MalformedTokenError::NotAnObject)?;

    let user_id = object
        .get(USER_ID_CLAIM)
        .and_then(Value::as_i64)
        .ok_or(MalformedTokenError::MissingUserId)?;
    let username = object
        .get(USERNAME_CLAIM)
        .and_then(Value::as_str)
        .ok_or(MalformedTokenError::MissingUsername)?;

    Ok(Claims {
        user_id,
        username: username.to_string(),
    })
}
