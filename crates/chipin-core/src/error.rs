//! Error taxonomy for the session core.
//!
//! Failures local to one request are returned to that caller only.
//! Failures during a refresh cycle are broadcast to every queued caller,
//! which is why `RefreshFailure` is `Clone` and carries no foreign error
//! types.

use std::time::Duration;

use thiserror::Error;

use crate::auth::state::TransitionError;
use crate::auth::token::MalformedTokenError;

/// Persistence failure in a credential store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Credential file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored credentials are corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Credential storage unavailable: {0}")]
    Unavailable(String),
}

/// Transport-level failure: the request never produced an HTTP response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NetworkError::Timeout
        } else if e.is_connect() {
            NetworkError::Connect(e.to_string())
        } else {
            NetworkError::Request(e.to_string())
        }
    }
}

/// Terminal outcome of a failed refresh cycle, delivered identically to
/// every caller that waited on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh token rejected (status {0})")]
    Rejected(u16),

    #[error("Refresh request failed: {0}")]
    Network(String),

    #[error("Refresh timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Refresh response could not be parsed: {0}")]
    InvalidResponse(String),

    #[error("Refreshed access token is malformed: {0}")]
    MalformedToken(MalformedTokenError),

    #[error("Could not persist refreshed credentials: {0}")]
    Storage(String),

    #[error("Session ended while the refresh was in flight")]
    SessionEnded,

    #[error("Refresh task aborted")]
    Aborted,
}

/// Errors surfaced by the session facade and the request gateway.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Credential storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Malformed token: {0}")]
    MalformedToken(#[from] MalformedTokenError),

    /// The backend rejected the supplied credentials.
    #[error("{message}")]
    AuthFailure { message: String },

    #[error("Session expired: {0}")]
    Refresh(#[from] RefreshFailure),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// A request was rejected again after its one retry with a fresh token.
    #[error("Request unauthorized after token refresh")]
    Unauthorized,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Operation not allowed in current session state: {0}")]
    InvalidState(#[from] TransitionError),
}

/// Fallback shown when a credential rejection carries no backend message.
pub const GENERIC_AUTH_MESSAGE: &str = "Authentication failed";

impl SessionError {
    /// True when the caller must treat the session as gone and route to login.
    pub fn is_terminal_auth(&self) -> bool {
        matches!(self, SessionError::Refresh(_) | SessionError::Unauthorized)
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::AuthFailure { message } if !message.is_empty() => message.clone(),
            SessionError::AuthFailure { .. } => GENERIC_AUTH_MESSAGE.to_string(),
            SessionError::Refresh(_) | SessionError::Unauthorized => {
                "Your session has expired. Please log in again.".to_string()
            }
            SessionError::Network(NetworkError::Timeout) => {
                "Connection timed out. Please try again.".to_string()
            }
            SessionError::Network(_) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            other => other.to_string(),
        }
    }
}
