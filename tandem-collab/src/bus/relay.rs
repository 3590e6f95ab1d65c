//! WebSocket relay between processes.
//!
//! ```text
//!  RelayBus (instance A) ──┐                      ┌── RelayBus (instance B)
//!                          ├── BusRelay ──────────┤
//!  RelayBus (instance C) ──┘  pattern fan-out     └── ...
//! ```
//!
//! Wire commands are JSON text frames tagged by `op`:
//! - `{"op":"subscribe","pattern":"doc:*"}` — client → relay
//! - `{"op":"publish","frame":{...}}`        — client → relay
//! - `{"op":"deliver","frame":{...}}`        — relay → client
//!
//! The relay keeps no history. A client that is disconnected misses whatever
//! was published meanwhile; its publishes fail fast with
//! [`BusError::Disconnected`] while it reconnects with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use super::{topic_matches, BusError, BusFrame, FanoutBus, ALL_DOCUMENTS};
use crate::protocol::Message;

/// Relay wire commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayCommand {
    Subscribe { pattern: String },
    Publish { frame: BusFrame },
    Deliver { frame: BusFrame },
}

/// A published frame, encoded once as a `deliver` command.
struct Outbound {
    topic: String,
    text: String,
}

/// The relay broker process.
pub struct BusRelay {
    bind_addr: String,
    sender: broadcast::Sender<Arc<Outbound>>,
}

impl BusRelay {
    /// `capacity` frames are buffered per peer before it starts lagging.
    pub fn new(bind_addr: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            bind_addr: bind_addr.into(),
            sender,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    /// Bind the configured address and accept peers forever.
    pub async fn run(&self) -> Result<(), BusError> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        self.serve(listener).await
    }

    /// Accept peers on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BusError> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Bus relay listening on {addr}");
        }

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| BusError::Connection(e.to_string()))?;
            log::debug!("Bus relay peer connected from {addr}");

            let sender = self.sender.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_peer(stream, sender).await {
                    log::warn!("Bus relay peer {addr} failed: {e}");
                }
                log::debug!("Bus relay peer {addr} disconnected");
            });
        }
    }

    async fn handle_peer(
        stream: TcpStream,
        sender: broadcast::Sender<Arc<Outbound>>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut source) = ws.split();
        let mut published = sender.subscribe();
        let mut patterns: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                inbound = source.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<RelayCommand>(text.as_str()) {
                            Ok(RelayCommand::Subscribe { pattern }) => {
                                log::debug!("Bus relay peer subscribed to {pattern}");
                                patterns.push(pattern);
                            }
                            Ok(RelayCommand::Publish { frame }) => {
                                let topic = frame.topic.clone();
                                match serde_json::to_string(&RelayCommand::Deliver { frame }) {
                                    Ok(text) => {
                                        let _ = sender.send(Arc::new(Outbound { topic, text }));
                                    }
                                    Err(e) => log::warn!("Bus relay failed to encode frame: {e}"),
                                }
                            }
                            Ok(RelayCommand::Deliver { .. }) => {
                                log::warn!("Bus relay peer sent a deliver command, ignoring");
                            }
                            Err(e) => log::warn!("Bus relay received malformed command: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => sink.send(WsMessage::Pong(data)).await?,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => return Err(e),
                    Some(Ok(_)) => {}
                },

                outbound = published.recv() => match outbound {
                    Ok(out) => {
                        if patterns.iter().any(|p| topic_matches(p, &out.topic)) {
                            sink.send(WsMessage::Text(out.text.clone().into())).await?;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Bus relay peer lagged by {n} frames");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }
}

/// Connection state of a [`RelayBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Relay client settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `ws://host:port` of the relay
    pub url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Publishes buffered while the socket is busy
    pub outbound_capacity: usize,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            outbound_capacity: 1024,
        }
    }
}

struct RelayShared {
    state: RwLock<ConnectionState>,
    outgoing: RwLock<Option<mpsc::Sender<String>>>,
    subscribers: Mutex<Vec<mpsc::Sender<BusFrame>>>,
}

impl RelayShared {
    async fn dispatch(&self, frame: BusFrame) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Bus subscriber is full, dropping frame for {}", frame.topic);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

/// [`FanoutBus`] over a [`BusRelay`], reconnecting in the background.
pub struct RelayBus {
    instance_id: Uuid,
    shared: Arc<RelayShared>,
    supervisor: JoinHandle<()>,
}

impl RelayBus {
    /// Start connecting; returns immediately.
    pub fn connect(config: RelayConfig) -> Self {
        let shared = Arc::new(RelayShared {
            state: RwLock::new(ConnectionState::Disconnected),
            outgoing: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
        });
        let supervisor = tokio::spawn(Self::supervise(shared.clone(), config));
        Self {
            instance_id: Uuid::new_v4(),
            shared,
            supervisor,
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Wait until the relay connection is up, or give up after `within`.
    pub async fn wait_connected(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if self.connection_state().await == ConnectionState::Connected {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn supervise(shared: Arc<RelayShared>, config: RelayConfig) {
        let mut backoff = config.initial_backoff;
        loop {
            *shared.state.write().await = ConnectionState::Connecting;
            match tokio_tungstenite::connect_async(config.url.as_str()).await {
                Ok((ws, _)) => {
                    log::info!("Connected to bus relay at {}", config.url);
                    backoff = config.initial_backoff;
                    Self::run_session(&shared, ws, config.outbound_capacity).await;
                    log::warn!("Lost connection to bus relay at {}", config.url);
                }
                Err(e) => log::warn!("Bus relay at {} unreachable: {e}", config.url),
            }

            *shared.outgoing.write().await = None;
            *shared.state.write().await = ConnectionState::Reconnecting;
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(config.max_backoff);
        }
    }

    async fn run_session<S>(
        shared: &RelayShared,
        ws: tokio_tungstenite::WebSocketStream<S>,
        outbound_capacity: usize,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut source) = ws.split();

        let subscribe = RelayCommand::Subscribe {
            pattern: ALL_DOCUMENTS.to_string(),
        };
        let text = match serde_json::to_string(&subscribe) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode relay subscription: {e}");
                return;
            }
        };
        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
            log::warn!("Failed to subscribe on bus relay: {e}");
            return;
        }

        let (tx, mut rx) = mpsc::channel::<String>(outbound_capacity.max(1));
        *shared.outgoing.write().await = Some(tx);
        *shared.state.write().await = ConnectionState::Connected;

        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            log::warn!("Bus relay write failed: {e}");
                            break;
                        }
                    }
                    None => break,
                },

                inbound = source.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<RelayCommand>(text.as_str()) {
                            Ok(RelayCommand::Deliver { frame }) => shared.dispatch(frame).await,
                            Ok(other) => log::debug!("Unexpected relay command: {other:?}"),
                            Err(e) => log::warn!("Malformed relay frame: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = sink.send(WsMessage::Pong(data)).await {
                            log::debug!("Bus relay pong failed: {e}");
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("Bus relay read failed: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

impl Drop for RelayBus {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[async_trait]
impl FanoutBus for RelayBus {
    fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        let command = RelayCommand::Publish {
            frame: BusFrame::new(self.instance_id, message.clone()),
        };
        let text = serde_json::to_string(&command).map_err(|e| BusError::Encode(e.to_string()))?;

        let outgoing = self
            .shared
            .outgoing
            .read()
            .await
            .clone()
            .ok_or(BusError::Disconnected)?;
        outgoing.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => BusError::Backpressure,
            TrySendError::Closed(_) => BusError::Disconnected,
        })
    }

    async fn subscribe_all(&self) -> Result<mpsc::Receiver<BusFrame>, BusError> {
        let (tx, rx) = mpsc::channel(1024);
        self.shared.subscribers.lock().await.push(tx);
        Ok(rx)
    }
}
