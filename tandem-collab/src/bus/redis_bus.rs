//! Redis pub/sub bus.
//!
//! Each message goes out as the bare JSON envelope with `PUBLISH doc:{id}`,
//! and every instance holds a single `PSUBSCRIBE doc:*`. Anything else that
//! speaks that convention can publish to, or listen on, the same channels.
//!
//! Nothing on the wire says which instance published a message. Redis echoes
//! our own publications back to us, so the bus remembers fingerprints of what
//! it recently sent and claims each one when it returns. Claimed messages are
//! stamped with this instance's id; everything else arrives with a nil origin.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{topic_for, BusError, BusFrame, FanoutBus, ALL_DOCUMENTS};
use crate::protocol::Message;

/// Publications remembered while waiting for their echo.
const ECHO_WINDOW: usize = 4096;

fn fingerprint(payload: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish()
}

#[derive(Default)]
struct EchoWindow {
    pending: HashMap<u64, usize>,
    order: VecDeque<u64>,
}

impl EchoWindow {
    fn release(&mut self, key: u64) -> bool {
        match self.pending.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.pending.remove(&key);
                true
            }
            None => false,
        }
    }
}

/// Fingerprints of payloads this instance published and has not yet
/// received back. Bounded; the oldest entries are forgotten first.
#[derive(Default)]
struct Echoes {
    window: Mutex<EchoWindow>,
}

impl Echoes {
    fn record(&self, payload: &str) {
        let key = fingerprint(payload);
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        *window.pending.entry(key).or_insert(0) += 1;
        window.order.push_back(key);
        while window.order.len() > ECHO_WINDOW {
            if let Some(oldest) = window.order.pop_front() {
                window.release(oldest);
            }
        }
    }

    /// True if `payload` is one of ours. Each recorded publication is
    /// claimed at most once.
    fn claim(&self, payload: &str) -> bool {
        let key = fingerprint(payload);
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if !window.release(key) {
            return false;
        }
        if let Some(position) = window.order.iter().position(|k| *k == key) {
            window.order.remove(position);
        }
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }
}

fn connection_error(e: redis::RedisError) -> BusError {
    BusError::Connection(e.to_string())
}

/// The text published for a message: the client-facing envelope, unwrapped.
pub fn wire_payload(message: &Message) -> Result<String, BusError> {
    message.encode().map_err(|e| BusError::Encode(e.to_string()))
}

/// Fan-out over a Redis server.
pub struct RedisBus {
    instance_id: Uuid,
    client: redis::Client,
    publisher: MultiplexedConnection,
    echoes: Arc<Echoes>,
}

impl RedisBus {
    /// Connect the publishing side. `url` is a `redis://` URL.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(connection_error)?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connection_error)?;
        let instance_id = Uuid::new_v4();
        log::info!("Instance {instance_id} joined Redis bus at {url}");

        Ok(Self {
            instance_id,
            client,
            publisher,
            echoes: Arc::new(Echoes::default()),
        })
    }
}

#[async_trait]
impl FanoutBus for RedisBus {
    fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        let payload = wire_payload(message)?;
        let topic = topic_for(message.document_id);

        // Recorded first: the echo can arrive before PUBLISH returns.
        self.echoes.record(&payload);
        let mut publisher = self.publisher.clone();
        let result: redis::RedisResult<i64> =
            publisher.publish(topic.as_str(), payload.as_str()).await;
        if let Err(e) = result {
            self.echoes.claim(&payload);
            return Err(connection_error(e));
        }
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<mpsc::Receiver<BusFrame>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(connection_error)?;
        pubsub
            .psubscribe(ALL_DOCUMENTS)
            .await
            .map_err(connection_error)?;

        let (tx, rx) = mpsc::channel(1024);
        let instance = self.instance_id;
        let echoes = self.echoes.clone();

        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                let topic = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Unreadable payload on {topic}: {e}");
                        continue;
                    }
                };
                let message = match Message::parse(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Malformed envelope on {topic}: {e}");
                        continue;
                    }
                };
                let origin = if echoes.claim(&payload) {
                    instance
                } else {
                    Uuid::nil()
                };

                if tx.send(BusFrame { origin, topic, message }).await.is_err() {
                    break;
                }
            }
            log::warn!("Redis subscription for instance {instance} ended");
        });

        Ok(rx)
    }
}
