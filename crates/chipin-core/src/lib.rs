//! Session lifecycle core for the chipin client.
//!
//! - `auth`: credential storage, token claims, the session state machine,
//!   single-flight refresh and the `Session` facade
//! - `api`: HTTP transport, the authenticated request gateway and typed
//!   event endpoints
//! - `models`: event data types
//! - `config`: client configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod models;

pub use api::{ApiError, ApiRequest, ApiResponse, EventsApi, Gateway, HttpTransport, Transport};
pub use auth::{
    Claims, CredentialStore, Credentials, EndReason, Session, SessionSignal, SessionState,
};
pub use config::Config;
pub use error::{NetworkError, RefreshFailure, SessionError, StorageError};
