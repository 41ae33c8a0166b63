//! Shared fixtures for the integration tests: a scripted transport that
//! plays the backend, token builders, and a store that refuses to write.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chipin_core::auth::MemoryCredentialStore;
use chipin_core::{
    ApiRequest, ApiResponse, Config, CredentialStore, Credentials, NetworkError, Session,
    SessionSignal, StorageError, Transport,
};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// One request as the transport saw it.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: String,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<Value>,
}

type Responder = Arc<dyn Fn(&Call) -> Result<ApiResponse, NetworkError> + Send + Sync>;

#[derive(Clone)]
struct Route {
    latency: Duration,
    respond: Responder,
}

/// Transport that answers from per-route closures and records every call.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `METHOD path` with `respond` after `latency`.
    pub fn route<F>(&self, method: &str, path: &str, latency: Duration, respond: F)
    where
        F: Fn(&Call) -> Result<ApiResponse, NetworkError> + Send + Sync + 'static,
    {
        self.routes.lock().unwrap().insert(
            format!("{} {}", method, path),
            Route {
                latency,
                respond: Arc::new(respond),
            },
        );
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.path == path)
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, NetworkError> {
        let call = Call {
            method: request.method().to_string(),
            path: request.path().to_string(),
            bearer: bearer.map(str::to_string),
            body: request.body().cloned(),
        };
        self.calls.lock().unwrap().push(call.clone());

        let route = self
            .routes
            .lock()
            .unwrap()
            .get(&format!("{} {}", call.method, call.path))
            .cloned();
        let Some(route) = route else {
            return Ok(respond(StatusCode::NOT_FOUND, json!({ "detail": "Not found." })));
        };

        if !route.latency.is_zero() {
            tokio::time::sleep(route.latency).await;
        }
        (route.respond)(&call)
    }
}

/// Store whose writes always fail. Reads return whatever it was seeded with.
pub struct FailingStore {
    seeded: Option<Credentials>,
}

impl FailingStore {
    pub fn new(seeded: Option<Credentials>) -> Self {
        Self { seeded }
    }
}

impl CredentialStore for FailingStore {
    fn save(&self, _: &Credentials) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("disk full".to_string()))
    }

    fn load(&self) -> Result<Option<Credentials>, StorageError> {
        Ok(self.seeded.clone())
    }

    fn clear(&self) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("disk full".to_string()))
    }
}

pub fn respond(status: StatusCode, body: Value) -> ApiResponse {
    ApiResponse::new(status, body.to_string())
}

pub fn ok(body: Value) -> Result<ApiResponse, NetworkError> {
    Ok(respond(StatusCode::OK, body))
}

pub fn unauthorized() -> Result<ApiResponse, NetworkError> {
    Ok(respond(
        StatusCode::UNAUTHORIZED,
        json!({ "detail": "Given token not valid for any token type" }),
    ))
}

/// Compact token carrying `user_id` and `username`; `nonce` keeps tokens
/// for the same user distinct.
pub fn token(user_id: i64, username: &str, nonce: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        json!({ "user_id": user_id, "username": username, "jti": nonce }).to_string(),
    );
    format!("{}.{}.signature", header, payload)
}

/// Well-formed token whose payload lacks the identity claims.
pub fn token_without_claims() -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
    let payload = URL_SAFE_NO_PAD.encode(br#"{"token_type":"access","exp":1}"#);
    format!("{}.{}.signature", header, payload)
}

pub fn test_config() -> Config {
    Config {
        api_base_url: "http://backend.test/api/v1".to_string(),
        refresh_timeout_secs: 5,
        ..Config::default()
    }
}

/// A session restored from `credentials` (or anonymous when `None`).
pub fn restored_session(
    config: &Config,
    credentials: Option<Credentials>,
    transport: Arc<ScriptedTransport>,
) -> (Session, Arc<MemoryCredentialStore>) {
    let store = Arc::new(match credentials {
        Some(c) => MemoryCredentialStore::with_credentials(c),
        None => MemoryCredentialStore::new(),
    });
    let session = Session::new(config, store.clone(), transport);
    session.restore().unwrap();
    (session, store)
}

/// Backend for `GET /events/` that accepts only the token in `valid`.
pub fn events_route(transport: &ScriptedTransport, latency: Duration, valid: Arc<Mutex<String>>) {
    transport.route("GET", "/events/", latency, move |call| {
        let valid = valid.lock().unwrap().clone();
        if call.bearer.as_deref() == Some(valid.as_str()) {
            ok(json!([{ "id": 1, "title": "Picnic", "participants_count": 2 }]))
        } else {
            unauthorized()
        }
    });
}

pub fn drain(signals: &mut broadcast::Receiver<SessionSignal>) -> Vec<SessionSignal> {
    let mut seen = Vec::new();
    while let Ok(signal) = signals.try_recv() {
        seen.push(signal);
    }
    seen
}
