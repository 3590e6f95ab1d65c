//! Shared helpers for the end-to-end tests: a server on a free port and a
//! raw WebSocket peer that understands newline-coalesced frames.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tandem_collab::auth::StaticTokens;
use tandem_collab::protocol::{DocumentId, Message, MessageType, Permission, UserId};
use tandem_collab::storage::{DocumentStore, MemoryStore};
use tandem_collab::{Backends, FanoutBus, ServerConfig, SyncServer};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const ALICE: UserId = 1;
pub const BOB: UserId = 2;
pub const CAROL: UserId = 3;
pub const MALLORY: UserId = 4;

pub fn tokens() -> StaticTokens {
    StaticTokens::new()
        .with("alice-token", ALICE)
        .with("bob-token", BOB)
        .with("carol-token", CAROL)
        .with("mallory-token", MALLORY)
}

/// A store with one document owned by Alice, shared with Bob (edit) and
/// Carol (view).
pub async fn seeded_store() -> (Arc<MemoryStore>, DocumentId) {
    let store = Arc::new(MemoryStore::new());
    let document = store.create_document("Notes", ALICE).await.unwrap();
    store
        .upsert_collaborator(document.id, BOB, Permission::Edit)
        .await
        .unwrap();
    store
        .upsert_collaborator(document.id, CAROL, Permission::View)
        .await
        .unwrap();
    (store, document.id)
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        max_message_size: 4096,
        ..ServerConfig::default()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<SyncServer>,
}

impl TestServer {
    pub fn url(&self, document: &str) -> String {
        format!("ws://{}/ws/{document}", self.addr)
    }

    pub async fn connect(&self, document_id: DocumentId, token: &str) -> Peer {
        Peer::connect(&self.url(&document_id.to_string()), token).await
    }

    /// Poll until the hub holds `expected` clients on the document.
    pub async fn wait_for_clients(&self, document_id: DocumentId, expected: usize) {
        for _ in 0..150 {
            if self.server.hub().client_count(document_id).await == expected {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "expected {expected} clients on document {document_id}, found {}",
            self.server.hub().client_count(document_id).await
        );
    }

    /// Poll until the server counts `expected` open connections.
    pub async fn wait_for_connections(&self, expected: u64) {
        for _ in 0..150 {
            if self.server.stats().await.active_connections == expected {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {expected} open connections");
    }
}

/// Start a server on a free port.
pub async fn start_server(
    config: ServerConfig,
    store: Arc<MemoryStore>,
    bus: Option<Arc<dyn FanoutBus>>,
) -> TestServer {
    let backends = Backends {
        documents: store.clone(),
        events: store,
        authenticator: Arc::new(tokens()),
        bus,
    };
    let server = Arc::new(SyncServer::new(config, backends));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    // Give the bus subscriber time to attach
    sleep(Duration::from_millis(50)).await;

    TestServer { addr, server }
}

/// HTTP status of a handshake that is expected to fail.
pub async fn handshake_status(url: &str, token: Option<&str>, origin: Option<&str>) -> u16 {
    let mut request = url.into_client_request().unwrap();
    if let Some(token) = token {
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {token}").parse().unwrap());
    }
    if let Some(origin) = origin {
        request.headers_mut().insert("Origin", origin.parse().unwrap());
    }
    match tokio_tungstenite::connect_async(request).await {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected handshake error: {e}"),
        Ok(_) => panic!("handshake unexpectedly succeeded"),
    }
}

/// Raw client. Splits coalesced frames back into envelopes.
pub struct Peer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<Message>,
}

impl Peer {
    pub async fn connect(url: &str, token: &str) -> Self {
        let mut request = url.into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {token}").parse().unwrap());
        let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        Self {
            ws,
            pending: VecDeque::new(),
        }
    }

    pub async fn connect_with_query(url: &str, token: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("{url}?token={token}"))
            .await
            .unwrap();
        Self {
            ws,
            pending: VecDeque::new(),
        }
    }

    /// Next envelope, waiting up to two seconds.
    pub async fn next(&mut self) -> Message {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return message;
            }
            let frame = timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed")
                .expect("read error");
            self.buffer(frame);
        }
    }

    /// Skip envelopes until one of `kind` arrives.
    pub async fn next_of(&mut self, kind: MessageType) -> Message {
        loop {
            let message = self.next().await;
            if message.kind == kind {
                return message;
            }
        }
    }

    /// Whether nothing arrives for `window`.
    pub async fn is_quiet(&mut self, window: Duration) -> bool {
        if !self.pending.is_empty() {
            return false;
        }
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return true,
                Ok(Some(Ok(WsMessage::Ping(_)))) | Ok(Some(Ok(WsMessage::Pong(_)))) => continue,
                Ok(Some(Ok(frame))) => {
                    self.buffer(frame);
                    return self.pending.is_empty();
                }
                Ok(_) => return false,
            }
        }
    }

    /// Whether the server closed the connection within `window`.
    pub async fn is_closed_within(&mut self, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(WsMessage::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(WsMessage::Text(text.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    fn buffer(&mut self, frame: WsMessage) {
        if let WsMessage::Text(text) = frame {
            for line in text.as_str().split('\n') {
                self.pending
                    .push_back(Message::parse(line).expect("server sent a malformed envelope"));
            }
        }
    }
}
