//! Authenticated request gateway.
//!
//! Screens hand requests to the gateway and get back whatever the backend
//! answered. The gateway attaches the access token, and when the backend
//! rejects it, drives one refresh through the coordinator and replays the
//! request once with the new token.

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, warn};

use super::transport::{ApiRequest, ApiResponse, Transport};
use crate::auth::coordinator::RefreshCoordinator;
use crate::auth::state::{SessionCell, SessionState};
use crate::error::SessionError;

#[derive(Clone)]
pub struct Gateway {
    transport: Arc<dyn Transport>,
    cell: Arc<SessionCell>,
    coordinator: RefreshCoordinator,
    forbidden_is_unauthorized: bool,
}

impl Gateway {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        cell: Arc<SessionCell>,
        coordinator: RefreshCoordinator,
        forbidden_is_unauthorized: bool,
    ) -> Self {
        Self {
            transport,
            cell,
            coordinator,
            forbidden_is_unauthorized,
        }
    }

    /// Send `request` with the current credentials.
    ///
    /// Every status other than an auth rejection is returned unchanged. An
    /// auth rejection of an authenticated request triggers one refresh and
    /// one replay; a rejection of the replay is `SessionError::Unauthorized`.
    /// Requests sent without a session get their rejection back as-is.
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, SessionError> {
        let token = self.current_token().await?;
        let response = self.transport.execute(&request, token.as_deref()).await?;

        if !self.is_unauthorized(response.status()) {
            return Ok(response);
        }
        let Some(token) = token else {
            debug!(path = request.path(), "Unauthenticated request rejected");
            return Ok(response);
        };
        if request.is_retried() {
            warn!(path = request.path(), "Replayed request rejected again");
            return Err(SessionError::Unauthorized);
        }

        request.mark_retried();
        let fresh = self.coordinator.refresh(&token).await?;

        debug!(path = request.path(), "Replaying request with refreshed token");
        let response = self.transport.execute(&request, Some(&fresh)).await?;
        if self.is_unauthorized(response.status()) {
            warn!(
                path = request.path(),
                status = %response.status(),
                "Request rejected even with a refreshed token"
            );
            return Err(SessionError::Unauthorized);
        }
        Ok(response)
    }

    /// Token to send with, after any in-flight refresh has settled.
    async fn current_token(&self) -> Result<Option<String>, SessionError> {
        loop {
            // Don't fire a request we already know will bounce
            let waited = self.coordinator.wait_for_refresh().await;
            let snapshot = self.cell.snapshot();
            match (&snapshot.state, waited) {
                // A cycle started after the wait; sending now would go out bare
                (SessionState::Refreshing(_), _) => tokio::task::yield_now().await,
                // Covers a login that landed while an earlier cycle failed
                (SessionState::Authenticated(_), _) => {
                    return Ok(snapshot.bearer().map(str::to_string))
                }
                (_, Some(Err(failure))) => return Err(failure.into()),
                _ => return Ok(None),
            }
        }
    }

    fn is_unauthorized(&self, status: StatusCode) -> bool {
        status == StatusCode::UNAUTHORIZED
            || (self.forbidden_is_unauthorized && status == StatusCode::FORBIDDEN)
    }
}
