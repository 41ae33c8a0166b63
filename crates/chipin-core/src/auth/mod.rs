//! Authentication module for managing the user session and its credentials.
//!
//! This module provides:
//! - `CredentialStore`: durable token storage (OS keychain, file, memory)
//! - `token`: claims decoding from the access token payload
//! - `SessionState`: the session state machine
//! - `RefreshCoordinator`: at most one token refresh in flight per session
//! - `Session`: login, registration, logout and the current user

pub mod coordinator;
pub mod credentials;
pub mod session;
pub mod state;
pub mod token;

pub use coordinator::{RefreshCoordinator, RefreshOutcome, RefreshSettings};
pub use credentials::{
    CredentialStore, Credentials, FileCredentialStore, KeyringCredentialStore,
    MemoryCredentialStore,
};
pub use session::Session;
pub use state::{EndReason, SessionSignal, SessionState, Transition, TransitionError};
pub use token::{Claims, MalformedTokenError};
