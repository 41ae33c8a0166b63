use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::coordinator::{RefreshCoordinator, RefreshSettings};
use super::credentials::{self, CredentialStore, Credentials};
use super::state::{
    CommitError, CredentialChange, EndReason, Guard, SessionCell, SessionSignal, SessionState,
    Transition,
};
use super::token::{self, Claims};
use crate::api::error::backend_message;
use crate::api::transport::{ApiRequest, HttpTransport, Transport};
use crate::api::{EventsApi, Gateway};
use crate::config::Config;
use crate::error::{SessionError, StorageError};

/// Shown when a login rejection carries no backend message
const LOGIN_FALLBACK_MESSAGE: &str = "Login failed";

/// Shown when a registration rejection carries no backend message
const REGISTER_FALLBACK_MESSAGE: &str = "Registration failed";

#[derive(Debug, Deserialize)]
struct TokenPair {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

impl From<CommitError> for SessionError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::Transition(e) => SessionError::InvalidState(e),
            CommitError::Storage(e) => SessionError::Storage(e),
        }
    }
}

/// Public surface of the session core.
///
/// Created in `Initializing`; call `restore` once the presentation layer has
/// subscribed to `signals`. Every state change goes through here or through
/// the refresh coordinator.
pub struct Session {
    cell: Arc<SessionCell>,
    transport: Arc<dyn Transport>,
    coordinator: RefreshCoordinator,
    gateway: Gateway,
    token_path: String,
    register_path: String,
}

impl Session {
    pub fn new(
        config: &Config,
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let cell = Arc::new(SessionCell::new(store));
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&cell),
            Arc::clone(&transport),
            RefreshSettings::from_config(config),
        );
        let gateway = Gateway::new(
            Arc::clone(&transport),
            Arc::clone(&cell),
            coordinator.clone(),
            config.forbidden_is_unauthorized,
        );

        Self {
            cell,
            transport,
            coordinator,
            gateway,
            token_path: config.token_path.clone(),
            register_path: config.register_path.clone(),
        }
    }

    /// Build a session over the configured credential store and HTTP.
    pub fn connect(config: &Config) -> Result<Self, SessionError> {
        let store = credentials::open(config)?;
        let transport = Arc::new(HttpTransport::new(config)?);
        Ok(Self::new(config, store, transport))
    }

    /// Hydrate from the credential store.
    ///
    /// A stored entry that does not parse, or whose token does not decode, is
    /// cleared. If the store cannot be read at all, the session still settles
    /// as `Anonymous` and the error is returned. Calling this again after startup returns the current state.
    pub fn restore(&self) -> Result<SessionState, SessionError> {
        if self.cell.state() != SessionState::Initializing {
            return Ok(self.cell.state());
        }

        let stored = match self.cell.store().load() {
            Ok(stored) => stored,
            Err(StorageError::Corrupt(e)) => {
                warn!(error = %e, "Stored credentials are corrupt, clearing them");
                self.discard_stored();
                return self.settle_anonymous();
            }
            Err(e) => {
                error!(error = %e, "Failed to load stored credentials");
                self.cell.commit(
                    Guard::Any,
                    Transition::NothingRestored,
                    CredentialChange::Keep,
                )?;
                return Err(e.into());
            }
        };

        let Some(credentials) = stored else {
            debug!("No stored session");
            return self.settle_anonymous();
        };

        match token::decode(&credentials.access_token) {
            Ok(claims) => {
                self.cell.commit(
                    Guard::Any,
                    Transition::Restored(claims.clone()),
                    CredentialChange::Adopt(credentials),
                )?;
                info!(user_id = claims.user_id, "Session restored");
                self.cell.emit(SessionSignal::SessionRestored(claims));
            }
            Err(e) => {
                warn!(error = %e, "Stored access token is malformed, clearing it");
                self.discard_stored();
                return self.settle_anonymous();
            }
        }
        Ok(self.cell.state())
    }

    fn discard_stored(&self) {
        if let Err(e) = self.cell.store().clear() {
            warn!(error = %e, "Failed to clear unusable credentials");
        }
    }

    fn settle_anonymous(&self) -> Result<SessionState, SessionError> {
        self.cell.commit(
            Guard::Any,
            Transition::NothingRestored,
            CredentialChange::Keep,
        )?;
        Ok(self.cell.state())
    }

    /// Exchange a username and password for tokens and start a session.
    ///
    /// On rejection the backend's message is returned and the state is
    /// untouched.
    pub async fn login(&self, username: &str, password: &str) -> Result<Claims, SessionError> {
        let request = ApiRequest::post(self.token_path.clone())
            .with_body(json!({ "username": username, "password": password }));
        let response = self.transport.execute(&request, None).await?;

        if !response.is_success() {
            let message = backend_message(response.body())
                .unwrap_or_else(|| LOGIN_FALLBACK_MESSAGE.to_string());
            warn!(status = %response.status(), "Login rejected");
            return Err(SessionError::AuthFailure { message });
        }

        let tokens: TokenPair = response
            .json()
            .map_err(|e| SessionError::InvalidResponse(format!("token response: {}", e)))?;
        let claims = token::decode(&tokens.access)?;

        self.cell.commit(
            Guard::Any,
            Transition::LoggedIn(claims.clone()),
            CredentialChange::Save(Credentials::new(tokens.access, tokens.refresh)),
        )?;

        info!(user_id = claims.user_id, "Login successful");
        self.cell.emit(SessionSignal::SessionStarted(claims.clone()));
        Ok(claims)
    }

    /// Create an account. Does not log in; signals a route to the login screen.
    pub async fn register(&self, username: &str, password: &str) -> Result<(), SessionError> {
        let request = ApiRequest::post(self.register_path.clone()).with_body(json!({
            "username": username,
            "password": password,
            "password_confirm": password,
        }));
        let response = self.transport.execute(&request, None).await?;

        if !response.is_success() {
            let message = backend_message(response.body())
                .unwrap_or_else(|| REGISTER_FALLBACK_MESSAGE.to_string());
            warn!(status = %response.status(), "Registration rejected");
            return Err(SessionError::AuthFailure { message });
        }

        info!("Registration successful");
        self.cell.emit(SessionSignal::Registered {
            username: username.to_string(),
        });
        Ok(())
    }

    /// End the session and clear stored credentials. No-op when already anonymous.
    pub fn logout(&self) -> Result<(), SessionError> {
        match self.cell.commit(
            Guard::UnlessAnonymous,
            Transition::LoggedOut,
            CredentialChange::Clear,
        )? {
            Some(_) => {
                info!("Logged out");
                self.cell.emit(SessionSignal::SessionEnded(EndReason::LoggedOut));
            }
            None => debug!("Already logged out"),
        }
        Ok(())
    }

    /// Claims of the authenticated user; no network access.
    pub fn current_user(&self) -> Option<Claims> {
        match self.cell.state() {
            SessionState::Authenticated(claims) => Some(claims),
            _ => None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.cell.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.cell.watch()
    }

    pub fn signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.cell.signals()
    }

    pub fn gateway(&self) -> Gateway {
        self.gateway.clone()
    }

    pub fn events(&self) -> EventsApi {
        EventsApi::new(self.gateway.clone())
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }
}
