//! In-process bus: several hubs in one process share a broker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::{topic_matches, BusError, BusFrame, FanoutBus, ALL_DOCUMENTS};
use crate::protocol::Message;

/// Shared fan-out point. Clone it to hand it to more instances.
#[derive(Clone)]
pub struct LocalBroker {
    sender: broadcast::Sender<Arc<BusFrame>>,
}

impl LocalBroker {
    /// `capacity` frames are buffered per subscriber before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// A bus handle for one instance.
    pub fn connect(&self) -> LocalBus {
        LocalBus {
            instance_id: Uuid::new_v4(),
            broker: self.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// One instance's view of a [`LocalBroker`].
pub struct LocalBus {
    instance_id: Uuid,
    broker: LocalBroker,
}

#[async_trait]
impl FanoutBus for LocalBus {
    fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        let frame = Arc::new(BusFrame::new(self.instance_id, message.clone()));
        // No subscribers is not an error: nobody else is running.
        let _ = self.broker.sender.send(frame);
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<mpsc::Receiver<BusFrame>, BusError> {
        let mut inbound = self.broker.sender.subscribe();
        let (tx, rx) = mpsc::channel(1024);
        let instance = self.instance_id;

        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(frame) => {
                        if !topic_matches(ALL_DOCUMENTS, &frame.topic) {
                            continue;
                        }
                        if tx.send(frame.as_ref().clone()).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Local bus subscriber {instance} lagged by {n} frames");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}
