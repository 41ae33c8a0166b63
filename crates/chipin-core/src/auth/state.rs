//! Session state machine and the process-wide cell that holds it.
//!
//! `SessionState::apply` is the transition table. `SessionCell` pairs the
//! state with the in-memory credentials and the credential store so that a
//! transition and its persistence happen under one lock.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error};

use super::credentials::{CredentialStore, Credentials};
use super::token::Claims;
use crate::error::StorageError;

/// Capacity of the presentation signal channel
const SIGNAL_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Anonymous,
    Authenticated(Claims),
    Refreshing(Claims),
    Invalid,
}

/// Events that move the session between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Startup found a decodable access token.
    Restored(Claims),
    /// Startup found nothing usable.
    NothingRestored,
    LoggedIn(Claims),
    RefreshStarted,
    Refreshed(Claims),
    RefreshFailed,
    /// Credentials were cleared after a failed refresh.
    InvalidCleared,
    LoggedOut,
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Transition::Restored(_) => "Restored",
            Transition::NothingRestored => "NothingRestored",
            Transition::LoggedIn(_) => "LoggedIn",
            Transition::RefreshStarted => "RefreshStarted",
            Transition::Refreshed(_) => "Refreshed",
            Transition::RefreshFailed => "RefreshFailed",
            Transition::InvalidCleared => "InvalidCleared",
            Transition::LoggedOut => "LoggedOut",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{event} is not valid while {from}")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: &'static str,
}

impl SessionState {
    /// Compute the state that follows `transition`, or reject it.
    pub fn apply(&self, transition: Transition) -> Result<SessionState, TransitionError> {
        use SessionState::*;

        let next = match (self, &transition) {
            (Initializing, Transition::Restored(claims)) => Authenticated(claims.clone()),
            (Initializing, Transition::NothingRestored) => Anonymous,
            // A login replaces whatever session was there, including one mid-refresh
            (Anonymous | Authenticated(_) | Refreshing(_), Transition::LoggedIn(claims)) => {
                Authenticated(claims.clone())
            }
            (Authenticated(claims), Transition::RefreshStarted) => Refreshing(claims.clone()),
            (Refreshing(_), Transition::Refreshed(claims)) => Authenticated(claims.clone()),
            (Refreshing(_), Transition::RefreshFailed) => Invalid,
            (Invalid, Transition::InvalidCleared) => Anonymous,
            (Anonymous | Authenticated(_) | Refreshing(_) | Invalid, Transition::LoggedOut) => {
                Anonymous
            }
            _ => {
                return Err(TransitionError {
                    from: self.name(),
                    event: transition.name(),
                })
            }
        };
        Ok(next)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Initializing => "Initializing",
            SessionState::Anonymous => "Anonymous",
            SessionState::Authenticated(_) => "Authenticated",
            SessionState::Refreshing(_) => "Refreshing",
            SessionState::Invalid => "Invalid",
        }
    }

    /// Claims of the session, if one exists (authenticated or refreshing).
    pub fn claims(&self) -> Option<&Claims> {
        match self {
            SessionState::Authenticated(claims) | SessionState::Refreshing(claims) => Some(claims),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }

    /// `Initializing`, `Refreshing` and `Invalid` never persist.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SessionState::Anonymous | SessionState::Authenticated(_))
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.claims() {
            Some(claims) => write!(f, "{} as {}", self.name(), claims.username),
            None => write!(f, "{}", self.name()),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LoggedOut,
    /// The refresh cycle failed; the user must log in again.
    Expired,
}

/// Routing intents for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    SessionRestored(Claims),
    SessionStarted(Claims),
    SessionEnded(EndReason),
    /// Registration succeeded; route to the login screen.
    Registered { username: String },
}

// ============================================================================
// Session cell
// ============================================================================

/// Precondition checked under the cell lock before a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Guard {
    Any,
    /// Skip unless no login or logout happened since `epoch` was observed.
    Epoch(u64),
    /// Skip when the session is already anonymous.
    UnlessAnonymous,
}

/// What a commit does to stored and in-memory credentials.
#[derive(Debug, Clone)]
pub(crate) enum CredentialChange {
    Keep,
    /// Take credentials already in the store into memory.
    Adopt(Credentials),
    Save(Credentials),
    Clear,
    /// Drop in-memory credentials without touching the store.
    Forget,
}

/// Why a state commit did not happen.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Consistent view of state, credentials and epoch.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub state: SessionState,
    pub credentials: Option<Credentials>,
    pub epoch: u64,
}

impl Snapshot {
    /// Access token to attach to requests; present only while authenticated.
    pub fn bearer(&self) -> Option<&str> {
        if self.state.is_authenticated() {
            self.credentials.as_ref().map(|c| c.access_token.as_str())
        } else {
            None
        }
    }
}

struct CellInner {
    credentials: Option<Credentials>,
    /// Bumped whenever the in-memory credentials change.
    epoch: u64,
}

/// The single live session: state, active credentials and store.
pub(crate) struct SessionCell {
    store: Arc<dyn CredentialStore>,
    inner: Mutex<CellInner>,
    state: watch::Sender<SessionState>,
    signals: broadcast::Sender<SessionSignal>,
}

impl SessionCell {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (state, _) = watch::channel(SessionState::Initializing);
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self {
            store,
            inner: Mutex::new(CellInner {
                credentials: None,
                epoch: 0,
            }),
            state,
            signals,
        }
    }

    pub fn store(&self) -> &dyn CredentialStore {
        self.store.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    pub fn emit(&self, signal: SessionSignal) {
        debug!(?signal, "Session signal");
        // No receivers is fine: nobody is listening for routing intents
        let _ = self.signals.send(signal);
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.lock();
        Snapshot {
            state: self.state(),
            credentials: inner.credentials.clone(),
            epoch: inner.epoch,
        }
    }

    /// Apply `transition` and `change` atomically.
    ///
    /// Returns `Ok(None)` when `guard` says to skip. The transition is
    /// validated before anything is persisted; a storage failure leaves
    /// state and credentials untouched.
    pub fn commit(
        &self,
        guard: Guard,
        transition: Transition,
        change: CredentialChange,
    ) -> Result<Option<(SessionState, u64)>, CommitError> {
        let mut inner = self.lock();
        let current = self.state();

        match guard {
            Guard::Any => {}
            Guard::Epoch(epoch) if epoch != inner.epoch => {
                debug!(expected = epoch, actual = inner.epoch, "Skipping stale commit");
                return Ok(None);
            }
            Guard::Epoch(_) => {}
            Guard::UnlessAnonymous if current == SessionState::Anonymous => return Ok(None),
            Guard::UnlessAnonymous => {}
        }

        let next = current.apply(transition)?;

        match change {
            CredentialChange::Keep => {}
            CredentialChange::Adopt(credentials) => {
                inner.credentials = Some(credentials);
                inner.epoch += 1;
            }
            CredentialChange::Save(credentials) => {
                self.store.save(&credentials)?;
                inner.credentials = Some(credentials);
                inner.epoch += 1;
            }
            CredentialChange::Clear => {
                self.store.clear()?;
                inner.credentials = None;
                inner.epoch += 1;
            }
            CredentialChange::Forget => {
                inner.credentials = None;
                inner.epoch += 1;
            }
        }

        debug!(from = current.name(), to = next.name(), "Session transition");
        self.state.send_replace(next.clone());
        Ok(Some((next, inner.epoch)))
    }

    fn lock(&self) -> MutexGuard<'_, CellInner> {
        // The guarded data stays consistent even if a holder panicked
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Session cell lock poisoned, continuing");
                poisoned.into_inner()
            }
        }
    }
}
