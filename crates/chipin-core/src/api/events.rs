//! Typed client for the event endpoints.
//!
//! These are plain authenticated calls; all token handling lives in the
//! gateway.

use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::ApiError;
use super::gateway::Gateway;
use super::transport::ApiRequest;
use crate::models::{EventDetail, EventSummary, NewEvent, StatusMessage};

#[derive(Clone)]
pub struct EventsApi {
    gateway: Gateway,
}

impl EventsApi {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub async fn list_events(&self) -> Result<Vec<EventSummary>, ApiError> {
        self.fetch(ApiRequest::get("/events/")).await
    }

    pub async fn event(&self, id: i64) -> Result<EventDetail, ApiError> {
        self.fetch(ApiRequest::get(format!("/events/{}/", id))).await
    }

    pub async fn create_event(&self, event: &NewEvent) -> Result<EventDetail, ApiError> {
        let request = ApiRequest::post("/events/")
            .json(event)
            .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
        self.fetch(request).await
    }

    pub async fn join_event(&self, id: i64) -> Result<StatusMessage, ApiError> {
        self.acknowledge(ApiRequest::post(format!("/events/{}/join/", id)))
            .await
    }

    /// Contribute `amount` towards the event's funding goal.
    pub async fn contribute(&self, id: i64, amount: f64) -> Result<StatusMessage, ApiError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(ApiError::InvalidInput(format!(
                "contribution must be a positive amount, got {}",
                amount
            )));
        }
        let request = ApiRequest::post(format!("/events/{}/contribute/", id))
            .with_body(serde_json::json!({ "amount": amount }));
        self.acknowledge(request).await
    }

    async fn fetch<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let path = request.path().to_string();
        let response = self.gateway.send(request).await?;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status(), response.body()));
        }
        response
            .json()
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", path, e)))
    }

    /// Like `fetch`, but an empty or unexpected success body is not an error.
    async fn acknowledge(&self, request: ApiRequest) -> Result<StatusMessage, ApiError> {
        let response = self.gateway.send(request).await?;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status(), response.body()));
        }
        Ok(response.json().unwrap_or_else(|e| {
            debug!(error = %e, "Acknowledgement body not understood");
            StatusMessage::default()
        }))
    }
}
