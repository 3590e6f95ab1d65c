//! Cross-instance fan-out.
//!
//! ```text
//!  instance A                         instance B
//!  ┌────────┐  publish(doc:7)  ┌─────┐  deliver(doc:*)  ┌────────┐
//!  │  Hub   │ ───────────────► │ bus │ ───────────────► │  Hub   │
//!  └────────┘                  └─────┘                  └────────┘
//!      ▲ local broadcast                          local broadcast │
//!      └─ clients on A                              clients on B ◄┘
//! ```
//!
//! Every instance publishes what its own clients produce and keeps one
//! wildcard subscription. Inbound frames are tagged with the publishing
//! instance when the backend can tell, so an instance never re-delivers its
//! own traffic. They are dropped unless the local hub has clients on that
//! document.
//!
//! Backends:
//! - [`local::LocalBroker`] — in-process, for several hubs in one process
//! - [`redis_bus::RedisBus`] — Redis `PUBLISH`/`PSUBSCRIBE`, bare envelopes
//! - [`relay::BusRelay`] / [`relay::RelayBus`] — WebSocket relay between processes

pub mod local;
pub mod redis_bus;
pub mod relay;

pub use local::{LocalBroker, LocalBus};
pub use redis_bus::RedisBus;
pub use relay::{BusRelay, ConnectionState, RelayBus, RelayConfig};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::hub::{BroadcastReport, Hub};
use crate::protocol::{DocumentId, Message};

/// Topic prefix for document traffic.
pub const TOPIC_PREFIX: &str = "doc:";

/// Pattern matching every document topic.
pub const ALL_DOCUMENTS: &str = "doc:*";

/// Topic for one document: `doc:{id}`.
pub fn topic_for(document_id: DocumentId) -> String {
    format!("{TOPIC_PREFIX}{document_id}")
}

/// Glob match supporting a single trailing `*`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

/// One message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusFrame {
    /// Instance that published the frame, nil when it is not known
    pub origin: Uuid,
    pub topic: String,
    pub message: Message,
}

impl BusFrame {
    pub fn new(origin: Uuid, message: Message) -> Self {
        Self {
            origin,
            topic: topic_for(message.document_id),
            message,
        }
    }
}

/// Bus errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    #[error("bus is disconnected")]
    Disconnected,
    #[error("bus outbound buffer is full")]
    Backpressure,
    #[error("bus encoding error: {0}")]
    Encode(String),
    #[error("bus connection error: {0}")]
    Connection(String),
}

/// Pub/sub transport between instances.
#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Identifier stamped on every frame this instance publishes.
    fn instance_id(&self) -> Uuid;

    /// Publish a message on its document topic.
    async fn publish(&self, message: &Message) -> Result<(), BusError>;

    /// Long-lived subscription to every document topic.
    async fn subscribe_all(&self) -> Result<mpsc::Receiver<BusFrame>, BusError>;
}

/// Local delivery through the hub plus publication to sibling instances.
pub struct Broadcaster {
    hub: Arc<Hub>,
    bus: Option<Arc<dyn FanoutBus>>,
}

impl Broadcaster {
    pub fn new(hub: Arc<Hub>, bus: Option<Arc<dyn FanoutBus>>) -> Self {
        Self { hub, bus }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Broadcast to local clients and publish on the bus, including the
    /// leave notices of any client evicted on the way.
    pub async fn deliver(&self, message: &Message) -> BroadcastReport {
        let report = self.hub.broadcast(message).await;
        self.publish(message).await;
        self.publish_all(&report.evicted).await;
        report
    }

    /// Publish only. Failures degrade fan-out and are logged.
    pub async fn publish(&self, message: &Message) {
        let Some(bus) = &self.bus else {
            return;
        };
        if let Err(e) = bus.publish(message).await {
            log::warn!(
                "Fan-out of {} for document {} failed: {e}",
                message.kind,
                message.document_id
            );
        }
    }

    pub async fn publish_all(&self, messages: &[Message]) {
        for message in messages {
            self.publish(message).await;
        }
    }
}

/// Deliver one inbound bus frame to the local hub.
///
/// Returns whether the frame was broadcast locally.
pub async fn relay_inbound(hub: &Hub, local_instance: Uuid, frame: BusFrame) -> bool {
    if frame.origin == local_instance {
        return false;
    }
    let document_id = frame.message.document_id;
    if hub.client_count(document_id).await == 0 {
        log::trace!("No local clients for document {document_id}, skipping bus frame");
        return false;
    }
    // Evictions here are local only; the origin instance owns its own presence.
    hub.broadcast(&frame.message).await;
    true
}

/// Subscribe to every document topic and feed the local hub until the
/// subscription ends.
pub async fn run_subscriber(bus: Arc<dyn FanoutBus>, hub: Arc<Hub>) -> Result<(), BusError> {
    let mut frames = bus.subscribe_all().await?;
    let instance = bus.instance_id();
    log::info!("Bus subscriber started for instance {instance}");

    while let Some(frame) = frames.recv().await {
        relay_inbound(&hub, instance, frame).await;
    }

    log::warn!("Bus subscription for instance {instance} ended");
    Ok(())
}

/// Spawn [`run_subscriber`] as a background task.
pub fn spawn_subscriber(bus: Arc<dyn FanoutBus>, hub: Arc<Hub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_subscriber(bus, hub).await {
            log::error!("Bus subscriber failed: {e}");
        }
    })
}
