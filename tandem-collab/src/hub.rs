//! Per-document registry of live connections and local broadcaster.
//!
//! ```text
//!            register / unregister / evict        (exclusive write)
//!                         │
//!   ┌─────────────────────▼───────────────────────┐
//!   │ Registry                                    │
//!   │   documents: doc_id → { client_id → Client }│
//!   │   index:     client_id → doc_id             │
//!   └─────────────────────┬───────────────────────┘
//!                         │ snapshot              (brief shared read)
//!                         ▼
//!        try_send(frame) per client queue         (no lock held)
//! ```
//!
//! The hub owns every client's sending half. Dropping it closes the client's
//! queue, which is the only signal its write pump observes. A queue that is
//! full when a frame arrives belongs to a consumer that fell behind: the
//! client is evicted on the spot and its peers get a `user_leave` notice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{
    ClientId, ConnectedPayload, DocumentId, Frame, Message, Permission, UserId,
};

/// Identity of one connection, fixed at accept time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub permission: Permission,
}

impl ClientInfo {
    /// New connection identity with a fresh random id.
    pub fn new(document_id: DocumentId, user_id: UserId, permission: Permission) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            document_id,
            user_id,
            permission,
        }
    }
}

/// A registered client: identity plus the sending half of its outbound queue.
#[derive(Debug)]
pub struct Client {
    pub info: ClientInfo,
    queue: mpsc::Sender<Frame>,
}

impl Client {
    pub fn new(info: ClientInfo, queue: mpsc::Sender<Frame>) -> Self {
        Self { info, queue }
    }

    /// Create a client together with the receiving end of its queue.
    pub fn with_capacity(info: ClientInfo, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(info, tx), rx)
    }
}

/// Outcome of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Clients on the document after the insert
    pub active_users: usize,
    /// The `user_join` notice delivered to peers
    pub join_notice: Message,
    /// `user_leave` notices for peers evicted while announcing the join
    pub evicted: Vec<Message>,
}

/// Outcome of removing a client.
#[derive(Debug, Clone)]
pub struct Unregistration {
    /// The `user_leave` notice delivered to remaining peers
    pub leave_notice: Message,
    pub evicted: Vec<Message>,
}

/// Outcome of a local broadcast.
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    /// Queues that accepted the frame
    pub delivered: usize,
    /// `user_leave` notices for every client evicted along the way
    pub evicted: Vec<Message>,
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub frames_sent: u64,
    pub evictions: u64,
    pub active_clients: usize,
    pub active_documents: usize,
}

/// Hub errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HubError {
    #[error("client {0} is already registered")]
    AlreadyRegistered(ClientId),
    #[error("client {0} could not accept its connection confirmation")]
    SlowConsumer(ClientId),
}

#[derive(Default)]
struct Registry {
    documents: HashMap<DocumentId, HashMap<ClientId, Arc<Client>>>,
    index: HashMap<ClientId, DocumentId>,
}

impl Registry {
    /// Remove a client, dropping its queue sender and the document set once empty.
    fn remove(&mut self, document_id: DocumentId, client_id: ClientId) -> Option<Arc<Client>> {
        let set = self.documents.get_mut(&document_id)?;
        let client = set.remove(&client_id)?;
        if set.is_empty() {
            self.documents.remove(&document_id);
        }
        self.index.remove(&client_id);
        Some(client)
    }
}

/// Lock-free counters.
#[derive(Default)]
struct AtomicHubStats {
    frames_sent: AtomicU64,
    evictions: AtomicU64,
}

/// Process-local registry of connected clients, keyed by document.
///
/// Construct one per process (or per test) and share it behind an `Arc`.
#[derive(Default)]
pub struct Hub {
    registry: RwLock<Registry>,
    stats: AtomicHubStats,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client to its document.
    ///
    /// The client is sent a `connected` confirmation and every other client of
    /// the document a `user_join`. If the confirmation does not fit in the
    /// client's queue the client is dropped again and no peer hears about it.
    pub async fn register(&self, client: Client) -> Result<Registration, HubError> {
        let info = client.info.clone();

        let active_users = {
            let mut registry = self.registry.write().await;
            if registry.index.contains_key(&info.id) {
                return Err(HubError::AlreadyRegistered(info.id));
            }

            let set = registry.documents.entry(info.document_id).or_default();
            let active_users = set.len() + 1;

            let confirmation = Message::connected(
                info.document_id,
                info.user_id,
                &ConnectedPayload {
                    client_id: info.id,
                    permission: info.permission,
                    active_users,
                },
            );
            let frame = match confirmation.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Failed to encode confirmation for client {}: {e}", info.id);
                    if set.is_empty() {
                        registry.documents.remove(&info.document_id);
                    }
                    return Err(HubError::SlowConsumer(info.id));
                }
            };

            if client.queue.try_send(frame).is_err() {
                if set.is_empty() {
                    registry.documents.remove(&info.document_id);
                }
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                log::warn!("Client {} rejected: queue full before confirmation", info.id);
                return Err(HubError::SlowConsumer(info.id));
            }
            self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);

            set.insert(info.id, Arc::new(client));
            registry.index.insert(info.id, info.document_id);
            active_users
        };

        log::info!(
            "Client {} (user {}) registered on document {} ({} active)",
            info.id,
            info.user_id,
            info.document_id,
            active_users
        );

        let join_notice = Message::user_join(info.document_id, info.user_id, info.permission);
        let report = self.deliver(&join_notice, Some(info.id)).await;

        Ok(Registration {
            active_users,
            join_notice,
            evicted: report.evicted,
        })
    }

    /// Remove a client and tell its peers.
    ///
    /// Idempotent: returns the `user_leave` notice only for the call that
    /// actually removed the client.
    pub async fn unregister(
        &self,
        document_id: DocumentId,
        client_id: ClientId,
    ) -> Option<Unregistration> {
        let removed = {
            let mut registry = self.registry.write().await;
            registry.remove(document_id, client_id)
        }?;

        let user_id = removed.info.user_id;
        log::info!("Client {client_id} (user {user_id}) unregistered from document {document_id}");
        // Closes the outbound queue unless a broadcast snapshot still holds it.
        drop(removed);

        let leave_notice = Message::user_leave(document_id, user_id);
        let report = self.deliver(&leave_notice, None).await;

        Some(Unregistration {
            leave_notice,
            evicted: report.evicted,
        })
    }

    /// Deliver to every client of the message's document.
    pub async fn broadcast(&self, message: &Message) -> BroadcastReport {
        self.deliver(message, None).await
    }

    /// Deliver to every client of the message's document except one.
    pub async fn broadcast_except(&self, message: &Message, excluded: ClientId) -> BroadcastReport {
        self.deliver(message, Some(excluded)).await
    }

    /// Number of clients registered on a document.
    pub async fn client_count(&self, document_id: DocumentId) -> usize {
        self.registry
            .read()
            .await
            .documents
            .get(&document_id)
            .map_or(0, HashMap::len)
    }

    /// Number of documents with at least one client.
    pub async fn document_count(&self) -> usize {
        self.registry.read().await.documents.len()
    }

    /// Whether a client id is currently registered.
    pub async fn is_registered(&self, client_id: ClientId) -> bool {
        self.registry.read().await.index.contains_key(&client_id)
    }

    pub async fn stats(&self) -> HubStats {
        let registry = self.registry.read().await;
        HubStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            active_clients: registry.index.len(),
            active_documents: registry.documents.len(),
        }
    }

    /// Fan a message out, evicting saturated clients.
    ///
    /// Evictions produce `user_leave` notices which are delivered to the
    /// survivors through the same loop, so a cascade never recurses.
    async fn deliver(&self, message: &Message, excluded: Option<ClientId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut pending = vec![(message.clone(), excluded, true)];

        while let Some((msg, skip, primary)) = pending.pop() {
            let frame = match msg.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Dropping {} for document {}: {e}", msg.kind, msg.document_id);
                    continue;
                }
            };

            let targets: Vec<Arc<Client>> = {
                let registry = self.registry.read().await;
                match registry.documents.get(&msg.document_id) {
                    Some(set) => set
                        .values()
                        .filter(|c| Some(c.info.id) != skip)
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                }
            };

            let mut dead = Vec::new();
            for client in &targets {
                match client.queue.try_send(frame.clone()) {
                    Ok(()) => {
                        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                        if primary {
                            report.delivered += 1;
                        }
                    }
                    Err(TrySendError::Full(_)) => {
                        log::warn!(
                            "Client {} on document {} is too slow, evicting",
                            client.info.id,
                            msg.document_id
                        );
                        dead.push(client.info.id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        log::debug!("Client {} queue already closed", client.info.id);
                        dead.push(client.info.id);
                    }
                }
            }
            drop(targets);

            if dead.is_empty() {
                continue;
            }
            for notice in self.evict(msg.document_id, &dead).await {
                report.evicted.push(notice.clone());
                pending.push((notice, None, false));
            }
        }

        report
    }

    async fn evict(&self, document_id: DocumentId, clients: &[ClientId]) -> Vec<Message> {
        let removed: Vec<Arc<Client>> = {
            let mut registry = self.registry.write().await;
            clients
                .iter()
                .filter_map(|id| registry.remove(document_id, *id))
                .collect()
        };

        self.stats
            .evictions
            .fetch_add(removed.len() as u64, Ordering::Relaxed);

        removed
            .iter()
            .map(|c| Message::user_leave(document_id, c.info.user_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use serde_json::json;

    fn join(
        document_id: DocumentId,
        user_id: UserId,
        capacity: usize,
    ) -> (Client, mpsc::Receiver<Frame>) {
        Client::with_capacity(ClientInfo::new(document_id, user_id, Permission::Edit), capacity)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(Message::parse(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_register_sends_confirmation() {
        let hub = Hub::new();
        let (client, mut rx) = join(1, 10, 16);
        let client_id = client.info.id;

        let registration = hub.register(client).await.unwrap();
        assert_eq!(registration.active_users, 1);

        let received = drain(&mut rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, MessageType::Connected);
        let payload: ConnectedPayload = received[0].payload_as().unwrap();
        assert_eq!(payload.client_id, client_id);
        assert_eq!(payload.permission, Permission::Edit);
        assert_eq!(payload.active_users, 1);
    }

    #[tokio::test]
    async fn test_join_notifies_peers_once() {
        let hub = Hub::new();
        let (bob, mut bob_rx) = join(1, 20, 16);
        hub.register(bob).await.unwrap();
        drain(&mut bob_rx);

        let (alice, mut alice_rx) = join(1, 10, 16);
        let registration = hub.register(alice).await.unwrap();
        assert_eq!(registration.active_users, 2);
        assert_eq!(registration.join_notice.user_id, 10);

        let to_bob = drain(&mut bob_rx);
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_bob[0].kind, MessageType::UserJoin);
        assert_eq!(to_bob[0].payload, json!({"user_id": 10, "permission": "edit"}));

        let to_alice = drain(&mut alice_rx);
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_alice[0].kind, MessageType::Connected);
    }

    #[tokio::test]
    async fn test_counts_track_register_and_unregister() {
        let hub = Hub::new();
        let (a, _a_rx) = join(1, 10, 16);
        let (b, _b_rx) = join(1, 20, 16);
        let a_id = a.info.id;
        let b_id = b.info.id;

        assert_eq!(hub.client_count(1).await, 0);
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        assert_eq!(hub.client_count(1).await, 2);
        assert_eq!(hub.document_count().await, 1);

        assert!(hub.unregister(1, a_id).await.is_some());
        assert_eq!(hub.client_count(1).await, 1);

        // Second unregister of the same client is a no-op
        assert!(hub.unregister(1, a_id).await.is_none());
        assert_eq!(hub.client_count(1).await, 1);

        assert!(hub.unregister(1, b_id).await.is_some());
        assert_eq!(hub.client_count(1).await, 0);
        assert_eq!(hub.document_count().await, 0);
        assert!(!hub.is_registered(b_id).await);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let hub = Hub::new();
        let info = ClientInfo::new(1, 10, Permission::Edit);
        let (first, _rx1) = Client::with_capacity(info.clone(), 16);
        let (second, _rx2) = Client::with_capacity(info.clone(), 16);

        hub.register(first).await.unwrap();
        assert_eq!(
            hub.register(second).await.unwrap_err(),
            HubError::AlreadyRegistered(info.id)
        );
        assert_eq!(hub.client_count(1).await, 1);
    }

    #[tokio::test]
    async fn test_unregister_notifies_remaining_peers() {
        let hub = Hub::new();
        let (a, mut a_rx) = join(1, 10, 16);
        let (b, mut b_rx) = join(1, 20, 16);
        let b_id = b.info.id;
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        drain(&mut a_rx);

        let departure = hub.unregister(1, b_id).await.unwrap();
        assert_eq!(departure.leave_notice.kind, MessageType::UserLeave);

        let to_a = drain(&mut a_rx);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0].payload, json!({"user_id": 20}));

        // Removed client's queue is closed after its pending frames
        drain(&mut b_rx);
        assert!(b_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_is_scoped_to_document() {
        let hub = Hub::new();
        let (a, mut a_rx) = join(1, 10, 16);
        let (b, mut b_rx) = join(1, 20, 16);
        let (other, mut other_rx) = join(2, 30, 16);
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        hub.register(other).await.unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut other_rx);

        let report = hub.broadcast(&Message::cursor(1, 10, json!({"position": 4}))).await;
        assert_eq!(report.delivered, 2);
        assert!(report.evicted.is_empty());

        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(drain(&mut b_rx).len(), 1);
        assert!(drain(&mut other_rx).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_one() {
        let hub = Hub::new();
        let (a, mut a_rx) = join(1, 10, 16);
        let (b, mut b_rx) = join(1, 20, 16);
        let a_id = a.info.id;
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        let report = hub
            .broadcast_except(&Message::cursor(1, 10, json!({})), a_id)
            .await;
        assert_eq!(report.delivered, 1);
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_document() {
        let hub = Hub::new();
        let report = hub.broadcast(&Message::cursor(99, 1, json!({}))).await;
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn test_saturated_client_evicted_without_blocking_others() {
        let hub = Hub::new();
        let (fast, mut fast_rx) = join(1, 10, 64);
        // The confirmation alone fills a queue of one
        let (slow, mut slow_rx) = join(1, 20, 1);
        let slow_id = slow.info.id;
        hub.register(fast).await.unwrap();
        hub.register(slow).await.unwrap();
        drain(&mut fast_rx);

        let report = hub.broadcast(&Message::cursor(1, 10, json!({"n": 1}))).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].user_id, 20);
        assert!(!hub.is_registered(slow_id).await);
        assert_eq!(hub.client_count(1).await, 1);

        let to_fast = drain(&mut fast_rx);
        assert_eq!(to_fast.len(), 2);
        assert_eq!(to_fast[0].kind, MessageType::Cursor);
        assert_eq!(to_fast[1].kind, MessageType::UserLeave);

        // The slow client keeps its confirmation, then sees its queue closed
        let frame = slow_rx.recv().await.unwrap();
        assert_eq!(Message::parse(&frame).unwrap().kind, MessageType::Connected);
        assert!(slow_rx.recv().await.is_none());

        assert_eq!(hub.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_saturated_client_evicted_by_registration() {
        let hub = Hub::new();
        let (slow, _slow_rx) = join(1, 20, 1);
        hub.register(slow).await.unwrap();

        let (newcomer, mut newcomer_rx) = join(1, 10, 16);
        let registration = hub.register(newcomer).await.unwrap();
        assert_eq!(registration.evicted.len(), 1);
        assert_eq!(hub.client_count(1).await, 1);

        let received = drain(&mut newcomer_rx);
        assert_eq!(received[0].kind, MessageType::Connected);
        assert_eq!(received[1].kind, MessageType::UserLeave);
    }

    #[tokio::test]
    async fn test_full_queue_rejected_before_confirmation() {
        let hub = Hub::new();
        let (peer, mut peer_rx) = join(1, 10, 16);
        hub.register(peer).await.unwrap();
        drain(&mut peer_rx);

        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(Frame::from("backlog")).unwrap();
        let client = Client::new(ClientInfo::new(1, 20, Permission::View), tx);
        let client_id = client.info.id;

        assert_eq!(
            hub.register(client).await.unwrap_err(),
            HubError::SlowConsumer(client_id)
        );
        assert_eq!(hub.client_count(1).await, 1);
        assert!(drain(&mut peer_rx).is_empty());
    }

    #[tokio::test]
    async fn test_closed_receiver_is_evicted() {
        let hub = Hub::new();
        let (a, mut a_rx) = join(1, 10, 16);
        let (b, b_rx) = join(1, 20, 16);
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        drain(&mut a_rx);
        drop(b_rx);

        let report = hub.broadcast(&Message::cursor(1, 10, json!({}))).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(hub.client_count(1).await, 1);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let hub = Hub::new();
        let (a, _a_rx) = join(1, 10, 16);
        let (b, _b_rx) = join(2, 20, 16);
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();

        let stats = hub.stats().await;
        assert_eq!(stats.active_clients, 2);
        assert_eq!(stats.active_documents, 2);
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.evictions, 0);
    }
}
