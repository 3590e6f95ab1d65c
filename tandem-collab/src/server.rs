//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! GET /ws/{document_id}
//!        │ id → origin → credential → access      (400 / 403 / 401 / 403)
//!        ▼
//!   upgrade ──► connection pumps ──► Hub (per document client sets)
//!                      │                 ▲
//!                      ▼                 │
//!              EditCoordinator ──► Broadcaster ──► FanoutBus ──► sibling instances
//!                      │
//!                      ├── DocumentStore (snapshot)
//!                      └── EventLog (versioned edits)
//! ```
//!
//! Everything that can fail is checked before the upgrade, so a rejected
//! handshake never reaches the hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;

use crate::access::AccessGate;
use crate::auth::{bearer_token, AuthError, Authenticator};
use crate::bus::{spawn_subscriber, Broadcaster, BusError, FanoutBus};
use crate::config::ServerConfig;
use crate::connection::{serve_connection, ConnectionContext};
use crate::coordinator::EditCoordinator;
use crate::hub::{ClientInfo, Hub};
use crate::protocol::DocumentId;
use crate::storage::{DocumentStore, EventLog, MemoryStore};

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// External services the server is wired to.
pub struct Backends {
    pub documents: Arc<dyn DocumentStore>,
    pub events: Arc<dyn EventLog>,
    pub authenticator: Arc<dyn Authenticator>,
    pub bus: Option<Arc<dyn FanoutBus>>,
}

impl Backends {
    /// One [`MemoryStore`] for both documents and events, no bus.
    pub fn in_memory(authenticator: Arc<dyn Authenticator>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            documents: store.clone(),
            events: store,
            authenticator,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn FanoutBus>) -> Self {
        self.bus = Some(bus);
        self
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub frames_sent: u64,
    pub evictions: u64,
    pub active_documents: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
}

struct ServerState {
    config: ServerConfig,
    gate: AccessGate,
    authenticator: Arc<dyn Authenticator>,
    connection: Arc<ConnectionContext>,
    counters: Counters,
}

/// The sync server.
pub struct SyncServer {
    state: Arc<ServerState>,
    bus: Option<Arc<dyn FanoutBus>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, backends: Backends) -> Self {
        let hub = Arc::new(Hub::new());
        let broadcaster = Arc::new(Broadcaster::new(hub.clone(), backends.bus.clone()));
        let coordinator = Arc::new(
            EditCoordinator::new(backends.events.clone(), broadcaster.clone())
                .with_max_attempts(config.edit_attempts),
        );

        let connection = Arc::new(ConnectionContext {
            hub,
            broadcaster,
            coordinator,
            config: config.connection(),
        });

        Self {
            state: Arc::new(ServerState {
                gate: AccessGate::new(backends.documents),
                authenticator: backends.authenticator,
                connection,
                counters: Counters::default(),
                config,
            }),
            bus: backends.bus,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.connection.hub
    }

    pub fn coordinator(&self) -> &Arc<EditCoordinator> {
        &self.state.connection.coordinator
    }

    pub fn gate(&self) -> &AccessGate {
        &self.state.gate
    }

    pub async fn stats(&self) -> ServerStats {
        let counters = &self.state.counters;
        let hub = self.hub().stats().await;
        ServerStats {
            total_connections: counters.total_connections.load(Ordering::Relaxed),
            active_connections: counters.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: counters.rejected_handshakes.load(Ordering::Relaxed),
            frames_sent: hub.frames_sent,
            evictions: hub.evictions,
            active_documents: hub.active_documents,
        }
    }

    /// HTTP routes; mount under another router or serve directly.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws/{document_id}", get(upgrade))
            .with_state(self.state.clone())
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        let subscriber = self
            .bus
            .clone()
            .map(|bus| spawn_subscriber(bus, self.hub().clone()));

        let result = axum::serve(listener, self.router()).await;

        if let Some(subscriber) = subscriber {
            subscriber.abort();
        }
        Ok(result?)
    }
}

fn reject(state: &ServerState, status: StatusCode, message: &str) -> Response {
    state
        .counters
        .rejected_handshakes
        .fetch_add(1, Ordering::Relaxed);
    (status, Json(json!({ "error": message }))).into_response()
}

async fn upgrade(
    State(state): State<Arc<ServerState>>,
    Path(raw_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(document_id) = raw_id.parse::<DocumentId>() else {
        return reject(&state, StatusCode::BAD_REQUEST, "Invalid document id");
    };

    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        log::warn!("Rejected upgrade from origin {origin:?}");
        return reject(&state, StatusCode::FORBIDDEN, "Origin not allowed");
    }

    let user_id = match credential(&headers, &params)
        .and_then(|token| state.authenticator.authenticate(token))
    {
        Ok(user_id) => user_id,
        Err(AuthError::MissingCredential) => {
            return reject(&state, StatusCode::UNAUTHORIZED, "Missing credential");
        }
        Err(e) => {
            log::debug!("Authentication failed: {e}");
            return reject(&state, StatusCode::UNAUTHORIZED, "Invalid credential");
        }
    };

    let permission = match state.gate.permission(user_id, document_id).await {
        Ok(Some(permission)) => permission,
        Ok(None) => {
            log::warn!("User {user_id} denied access to document {document_id}");
            return reject(&state, StatusCode::FORBIDDEN, "Access denied");
        }
        Err(e) => {
            log::error!("Access check for document {document_id} failed: {e}");
            return reject(&state, StatusCode::INTERNAL_SERVER_ERROR, "Access check failed");
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            state
                .counters
                .rejected_handshakes
                .fetch_add(1, Ordering::Relaxed);
            return rejection.into_response();
        }
    };

    let info = ClientInfo::new(document_id, user_id, permission);
    log::info!(
        "User {user_id} connecting to document {document_id} as {permission} (client {})",
        info.id
    );

    let max = state.config.max_message_size;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| async move {
            let counters = &state.counters;
            counters.total_connections.fetch_add(1, Ordering::Relaxed);
            counters.active_connections.fetch_add(1, Ordering::Relaxed);

            serve_connection(socket, info, state.connection.clone()).await;

            counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        })
}

/// Bearer header first, then the `token` query parameter.
fn credential<'a>(
    headers: &'a HeaderMap,
    params: &'a HashMap<String, String>,
) -> Result<&'a str, AuthError> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    from_header
        .or_else(|| params.get("token").map(String::as_str))
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingCredential)
}
