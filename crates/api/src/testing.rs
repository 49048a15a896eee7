//! In-process doubles for the operational store and the PHI broker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Map, Value, json};
use sokana_auth::{RequestSigner, SignatureVerifier, unix_epoch_ms_now};
use sokana_contracts::fields::IdentityCacheUpdate;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::broker::{PhiBrokerClient, REQUEST_ID_HEADER};
use crate::directory::{ClientDirectory, DirectoryError};

pub const BROKER_SECRET: &str = "api-test-broker-secret";

#[derive(Default)]
struct DirectoryState {
    clients: HashMap<Uuid, Map<String, Value>>,
    assignments: HashMap<String, Vec<Uuid>>,
    cache_updates: Vec<(Uuid, IdentityCacheUpdate)>,
    lookups: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl InMemoryDirectory {
    pub fn insert_client(&self, client_id: Uuid, row: Value) {
        let row = row.as_object().cloned().unwrap_or_default();
        self.state
            .lock()
            .expect("directory lock")
            .clients
            .insert(client_id, row);
    }

    pub fn assign(&self, doula_id: &str, client_id: Uuid) {
        self.state
            .lock()
            .expect("directory lock")
            .assignments
            .entry(doula_id.to_string())
            .or_default()
            .push(client_id);
    }

    pub fn cache_updates(&self) -> Vec<(Uuid, IdentityCacheUpdate)> {
        self.state.lock().expect("directory lock").cache_updates.clone()
    }

    pub fn lookups(&self) -> usize {
        self.state.lock().expect("directory lock").lookups
    }
}

impl ClientDirectory for InMemoryDirectory {
    async fn client_exists(&self, client_id: Uuid) -> Result<bool, DirectoryError> {
        let mut state = self.state.lock().expect("directory lock");
        state.lookups += 1;
        Ok(state.clients.contains_key(&client_id))
    }

    async fn load_client(
        &self,
        client_id: Uuid,
    ) -> Result<Option<Map<String, Value>>, DirectoryError> {
        let mut state = self.state.lock().expect("directory lock");
        state.lookups += 1;
        Ok(state.clients.get(&client_id).cloned())
    }

    async fn assigned_client_ids(&self, doula_id: &str) -> Result<Vec<Uuid>, DirectoryError> {
        let mut state = self.state.lock().expect("directory lock");
        state.lookups += 1;
        Ok(state.assignments.get(doula_id).cloned().unwrap_or_default())
    }

    async fn update_identity_cache(
        &self,
        client_id: Uuid,
        update: &IdentityCacheUpdate,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().expect("directory lock");
        if let Some(row) = state.clients.get_mut(&client_id) {
            let slots = [
                ("first_name", &update.first_name),
                ("last_name", &update.last_name),
                ("email", &update.email),
                ("phone_number", &update.phone_number),
            ];
            for (column, slot) in slots {
                if let Some(value) = slot {
                    row.insert(
                        column.to_string(),
                        value.clone().map(Value::String).unwrap_or(Value::Null),
                    );
                }
            }
        }
        state.cache_updates.push((client_id, update.clone()));
        Ok(())
    }

    async fn ping(&self) -> Result<(), DirectoryError> {
        Ok(())
    }
}

#[derive(Clone)]
struct MockBrokerState {
    verifier: SignatureVerifier,
    calls: Arc<AtomicUsize>,
    deny_writes: Arc<AtomicBool>,
    seen: Arc<Mutex<Vec<(Value, Option<String>)>>>,
}

pub struct MockBroker {
    pub addr: SocketAddr,
    pub calls: Arc<AtomicUsize>,
    pub deny_writes: Arc<AtomicBool>,
    seen: Arc<Mutex<Vec<(Value, Option<String>)>>>,
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl MockBroker {
    pub fn last_body(&self) -> Option<Value> {
        self.seen
            .lock()
            .expect("mock broker lock")
            .last()
            .map(|(body, _)| body.clone())
    }

    pub fn last_request_id(&self) -> Option<String> {
        self.seen
            .lock()
            .expect("mock broker lock")
            .last()
            .and_then(|(_, request_id)| request_id.clone())
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// Mock broker that checks signatures with the real verifier. Reads return
/// a fixed `due_date`; writes echo the non-null fields.
pub async fn spawn_mock_broker() -> MockBroker {
    let state = MockBrokerState {
        verifier: SignatureVerifier::new(Some(BROKER_SECRET)).expect("verifier"),
        calls: Arc::new(AtomicUsize::new(0)),
        deny_writes: Arc::new(AtomicBool::new(false)),
        seen: Arc::new(Mutex::new(Vec::new())),
    };

    async fn accept(state: &MockBrokerState, headers: &HeaderMap, body: &Bytes) -> Option<Value> {
        state
            .verifier
            .verify_headers(headers, body, unix_epoch_ms_now())
            .ok()?;
        state.calls.fetch_add(1, Ordering::SeqCst);

        let parsed: Value = serde_json::from_slice(body).ok()?;
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        state
            .seen
            .lock()
            .expect("mock broker lock")
            .push((parsed.clone(), request_id));
        Some(parsed)
    }

    async fn read(
        State(state): State<MockBrokerState>,
        headers: HeaderMap,
        body: Bytes,
    ) -> (StatusCode, Json<Value>) {
        match accept(&state, &headers, &body).await {
            Some(_) => (
                StatusCode::OK,
                Json(json!({"success": true, "data": {"due_date": "2026-03-14"}})),
            ),
            None => unauthorized(),
        }
    }

    async fn update(
        State(state): State<MockBrokerState>,
        headers: HeaderMap,
        body: Bytes,
    ) -> (StatusCode, Json<Value>) {
        let Some(parsed) = accept(&state, &headers, &body).await else {
            return unauthorized();
        };
        if state.deny_writes.load(Ordering::SeqCst) {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"success": false, "error": "Not authorized", "code": "ERR_FORBIDDEN"})),
            );
        }

        let written: Map<String, Value> = parsed["fields"]
            .as_object()
            .map(|fields| {
                fields
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        (
            StatusCode::OK,
            Json(json!({"success": true, "data": written})),
        )
    }

    fn unauthorized() -> (StatusCode, Json<Value>) {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "error": "Invalid request signature", "code": "ERR_AUTHENTICATION"})),
        )
    }

    async fn health() -> Json<Value> {
        Json(json!({"status": "healthy", "db": "connected"}))
    }

    let calls = state.calls.clone();
    let deny_writes = state.deny_writes.clone();
    let seen = state.seen.clone();

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/phi/client", post(read))
        .route("/v1/phi/client/update", post(update))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    MockBroker {
        addr,
        calls,
        deny_writes,
        seen,
        shutdown: shutdown_tx,
        task,
    }
}

pub fn broker_client(broker: &MockBroker) -> PhiBrokerClient {
    PhiBrokerClient::new(
        reqwest::Client::new(),
        format!("http://{}", broker.addr),
        RequestSigner::new(BROKER_SECRET).expect("signer"),
        Duration::from_secs(2),
    )
}
