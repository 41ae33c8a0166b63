//! Single-flight token refresh.
//!
//! The first caller that reports a rejected access token starts a refresh
//! cycle; every caller arriving while it runs joins a FIFO queue instead of
//! starting another one. The cycle itself runs on its own task, so dropping
//! any caller (including the one that started it) only removes that caller
//! from the queue. When the cycle settles, every queued caller receives the
//! same outcome in the order it enqueued.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::credentials::Credentials;
use super::state::{
    CommitError, CredentialChange, EndReason, Guard, SessionCell, SessionSignal, SessionState,
    Transition,
};
use super::token;
use crate::api::transport::{ApiRequest, Transport};
use crate::config::{Config, REFRESH_INITIAL_BACKOFF_MS};
use crate::error::RefreshFailure;

/// New access token on success; the same failure for every waiter otherwise.
pub type RefreshOutcome = Result<String, RefreshFailure>;

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub path: String,
    /// Bound on the whole cycle, retries included.
    pub timeout: Duration,
    pub network_retries: u32,
    pub initial_backoff: Duration,
}

impl RefreshSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            path: config.refresh_path.clone(),
            timeout: config.refresh_timeout(),
            network_retries: config.refresh_network_retries,
            initial_backoff: Duration::from_millis(REFRESH_INITIAL_BACKOFF_MS),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    /// Present when the backend rotates refresh tokens.
    #[serde(default)]
    refresh: Option<String>,
}

struct Cycle {
    id: u64,
    /// Session epoch the cycle was started under.
    epoch: u64,
    waiters: VecDeque<(u64, oneshot::Sender<RefreshOutcome>)>,
}

#[derive(Default)]
struct Flight {
    cycle: Option<Cycle>,
    next_ticket: u64,
}

struct Inner {
    cell: Arc<SessionCell>,
    transport: Arc<dyn Transport>,
    settings: RefreshSettings,
    flight: Mutex<Flight>,
    cycles: AtomicU64,
}

/// Guarantees at most one outstanding refresh per session.
/// Clone is cheap; clones share the same flight.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub(crate) fn new(
        cell: Arc<SessionCell>,
        transport: Arc<dyn Transport>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cell,
                transport,
                settings,
                flight: Mutex::new(Flight::default()),
                cycles: AtomicU64::new(0),
            }),
        }
    }

    /// Obtain a replacement for `rejected_token`, which the backend just refused.
    ///
    /// Joins the in-flight cycle if there is one, otherwise starts one. If the
    /// rejected token has already been replaced, returns the current token
    /// without starting a cycle.
    pub async fn refresh(&self, rejected_token: &str) -> RefreshOutcome {
        let waiter = {
            let mut flight = self.inner.flight();
            let snapshot = self.inner.cell.snapshot();
            Inner::detach_stale(&mut flight, snapshot.epoch);

            if flight.cycle.is_none() {
                match (&snapshot.state, snapshot.credentials) {
                    (SessionState::Authenticated(_), Some(current))
                        if current.access_token != rejected_token =>
                    {
                        debug!("Rejected token was already replaced, skipping refresh");
                        return Ok(current.access_token);
                    }
                    (SessionState::Authenticated(_), Some(_)) => {}
                    (state, _) => {
                        debug!(state = state.name(), "No session to refresh");
                        return Err(RefreshFailure::SessionEnded);
                    }
                }

                let epoch = match self.inner.cell.commit(
                    Guard::Any,
                    Transition::RefreshStarted,
                    CredentialChange::Keep,
                ) {
                    Ok(Some((_, epoch))) => epoch,
                    Ok(None) => return Err(RefreshFailure::SessionEnded),
                    Err(e) => {
                        warn!(error = %e, "Could not enter refreshing state");
                        return Err(RefreshFailure::SessionEnded);
                    }
                };

                let id = self.inner.cycles.fetch_add(1, Ordering::SeqCst) + 1;
                flight.cycle = Some(Cycle {
                    id,
                    epoch,
                    waiters: VecDeque::new(),
                });
                info!(cycle = id, "Access token rejected, starting refresh");
                tokio::spawn(Arc::clone(&self.inner).drive(id, epoch));
            }
            Inner::enqueue(&self.inner, &mut flight)
        };
        waiter.wait().await
    }

    /// Wait for the in-flight cycle, if any, and return its outcome.
    pub async fn wait_for_refresh(&self) -> Option<RefreshOutcome> {
        let waiter = {
            let mut flight = self.inner.flight();
            let epoch = self.inner.cell.snapshot().epoch;
            Inner::detach_stale(&mut flight, epoch);
            if flight.cycle.is_none() {
                return None;
            }
            Inner::enqueue(&self.inner, &mut flight)
        };
        Some(waiter.wait().await)
    }

    /// Whether a cycle for the current session is in flight.
    pub fn is_refreshing(&self) -> bool {
        let flight = self.inner.flight();
        let epoch = self.inner.cell.snapshot().epoch;
        flight.cycle.as_ref().is_some_and(|c| c.epoch == epoch)
    }

    /// Callers currently suspended on the in-flight cycle.
    pub fn queued(&self) -> usize {
        self.inner
            .flight()
            .cycle
            .as_ref()
            .map_or(0, |c| c.waiters.len())
    }

    /// Refresh cycles started since creation.
    pub fn cycles(&self) -> u64 {
        self.inner.cycles.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn flight(&self) -> MutexGuard<'_, Flight> {
        match self.flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Join the current cycle. Callers check that one exists.
    fn enqueue(this: &Arc<Self>, flight: &mut Flight) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let ticket = flight.next_ticket;
        flight.next_ticket += 1;
        if let Some(cycle) = flight.cycle.as_mut() {
            cycle.waiters.push_back((ticket, tx));
            debug!(ticket, queued = cycle.waiters.len(), "Waiting on refresh");
        }
        Waiter {
            inner: Arc::clone(this),
            ticket,
            rx,
        }
    }

    /// Fail the waiters of a cycle whose session has since ended.
    ///
    /// The detached cycle keeps running, but its result is discarded by the
    /// epoch guard and it no longer blocks a cycle for the new session.
    fn detach_stale(flight: &mut Flight, epoch: u64) {
        if !flight.cycle.as_ref().is_some_and(|c| c.epoch != epoch) {
            return;
        }
        if let Some(stale) = flight.cycle.take() {
            debug!(
                cycle = stale.id,
                waiters = stale.waiters.len(),
                "Session changed during refresh, detaching cycle"
            );
            for (_, tx) in stale.waiters {
                let _ = tx.send(Err(RefreshFailure::SessionEnded));
            }
        }
    }

    /// Run one refresh cycle to completion and resume every waiter.
    async fn drive(self: Arc<Self>, id: u64, epoch: u64) {
        let timeout = self.settings.timeout;
        let attempt =
            AssertUnwindSafe(tokio::time::timeout(timeout, self.request_new_credentials()))
                .catch_unwind()
                .await;

        let result = match attempt {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RefreshFailure::TimedOut(timeout)),
            Err(_) => {
                error!("Refresh task panicked");
                Err(RefreshFailure::Aborted)
            }
        };

        let outcome = self.settle(epoch, result);

        let waiters = {
            let mut flight = self.flight();
            if flight.cycle.as_ref().is_some_and(|c| c.id == id) {
                flight.cycle.take().map(|c| c.waiters).unwrap_or_default()
            } else {
                // Already detached; its waiters were failed then
                VecDeque::new()
            }
        };
        debug!(
            waiters = waiters.len(),
            success = outcome.is_ok(),
            "Refresh settled, resuming waiters"
        );
        for (_, tx) in waiters {
            // A waiter that was cancelled after the queue was drained just misses out
            let _ = tx.send(outcome.clone());
        }
    }

    async fn request_new_credentials(&self) -> Result<Credentials, RefreshFailure> {
        let refresh_token = self
            .cell
            .snapshot()
            .credentials
            .and_then(|c| c.refresh_token)
            .ok_or(RefreshFailure::NoRefreshToken)?;

        let request = ApiRequest::post(self.settings.path.clone())
            .with_body(json!({ "refresh": refresh_token.clone() }));

        let mut retries = 0;
        let mut backoff = self.settings.initial_backoff;

        loop {
            match self.transport.execute(&request, None).await {
                Ok(response) if response.is_success() => {
                    let body: RefreshResponse = response
                        .json()
                        .map_err(|e| RefreshFailure::InvalidResponse(e.to_string()))?;
                    return Ok(Credentials::new(
                        body.access,
                        body.refresh.or(Some(refresh_token)),
                    ));
                }
                Ok(response) => {
                    warn!(status = %response.status(), "Refresh endpoint rejected the refresh token");
                    return Err(RefreshFailure::Rejected(response.status().as_u16()));
                }
                Err(e) if retries < self.settings.network_retries => {
                    retries += 1;
                    warn!(
                        error = %e,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Refresh request failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(RefreshFailure::Network(e.to_string())),
            }
        }
    }

    /// Apply the cycle's result to the session and produce the shared outcome.
    fn settle(&self, epoch: u64, result: Result<Credentials, RefreshFailure>) -> RefreshOutcome {
        let refreshed = result.and_then(|credentials| {
            let claims =
                token::decode(&credentials.access_token).map_err(RefreshFailure::MalformedToken)?;
            Ok((credentials, claims))
        });

        let failure = match refreshed {
            Ok((credentials, claims)) => {
                let access_token = credentials.access_token.clone();
                match self.cell.commit(
                    Guard::Epoch(epoch),
                    Transition::Refreshed(claims.clone()),
                    CredentialChange::Save(credentials),
                ) {
                    Ok(Some(_)) => {
                        info!(user_id = claims.user_id, "Access token refreshed");
                        return Ok(access_token);
                    }
                    Ok(None) => {
                        info!("Session changed during refresh, discarding new token");
                        return Err(RefreshFailure::SessionEnded);
                    }
                    Err(CommitError::Transition(e)) => {
                        warn!(error = %e, "Session left refreshing state during refresh");
                        return Err(RefreshFailure::SessionEnded);
                    }
                    Err(CommitError::Storage(e)) => RefreshFailure::Storage(e.to_string()),
                }
            }
            Err(failure) => failure,
        };

        self.end_session(epoch, &failure);
        Err(failure)
    }

    /// Refreshing -> Invalid -> Anonymous, clearing stored credentials.
    fn end_session(&self, epoch: u64, failure: &RefreshFailure) {
        warn!(error = %failure, "Token refresh failed, ending session");

        let invalidated = match self.cell.commit(
            Guard::Epoch(epoch),
            Transition::RefreshFailed,
            CredentialChange::Clear,
        ) {
            Ok(result) => result,
            Err(CommitError::Storage(e)) => {
                error!(error = %e, "Failed to clear stored credentials after refresh failure");
                self.cell
                    .commit(
                        Guard::Epoch(epoch),
                        Transition::RefreshFailed,
                        CredentialChange::Forget,
                    )
                    .ok()
                    .flatten()
            }
            Err(CommitError::Transition(e)) => {
                warn!(error = %e, "Session left refreshing state during refresh");
                None
            }
        };

        // Someone else already ended or replaced the session
        if invalidated.is_none() {
            return;
        }

        if let Err(e) = self.cell.commit(
            Guard::Any,
            Transition::InvalidCleared,
            CredentialChange::Keep,
        ) {
            error!(error = %e, "Failed to reset invalid session");
        }
        self.cell.emit(SessionSignal::SessionEnded(EndReason::Expired));
    }
}

/// A caller suspended on the in-flight cycle. Dropping it leaves the queue.
struct Waiter {
    inner: Arc<Inner>,
    ticket: u64,
    rx: oneshot::Receiver<RefreshOutcome>,
}

impl Waiter {
    async fn wait(mut self) -> RefreshOutcome {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RefreshFailure::Aborted),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut flight = self.inner.flight();
        if let Some(cycle) = flight.cycle.as_mut() {
            let before = cycle.waiters.len();
            cycle.waiters.retain(|(ticket, _)| *ticket != self.ticket);
            if cycle.waiters.len() != before {
                debug!(ticket = self.ticket, "Cancelled caller left the refresh queue");
            }
        }
    }
}
