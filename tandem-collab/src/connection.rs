//! Per-connection read and write pumps.
//!
//! ```text
//!              ┌──────────── read pump (this task) ─────────────┐
//! socket ──►   │ edit   → EditCoordinator                       │
//!              │ cursor → Hub broadcast + bus                   │
//!              │ other  → logged, ignored                       │
//!              └───────────────────────┬────────────────────────┘
//!                                      │ exit: unregister once
//!              ┌──────────── write pump (spawned) ──────────────┐
//! socket ◄──   │ queue frames, coalesced with '\n'              │
//!              │ ping every `ping_interval`                     │
//!              │ queue closed → close frame, exit               │
//!              └────────────────────────────────────────────────┘
//! ```
//!
//! The read pump also watches the write pump: when writing fails, or the hub
//! closes the queue after an eviction, reading stops too and the connection
//! is torn down.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bus::Broadcaster;
use crate::config::ConnectionConfig;
use crate::coordinator::{EditCoordinator, EditError};
use crate::hub::{Client, ClientInfo, Hub, HubError};
use crate::protocol::{Frame, Message, MessageType};

/// Shared services every connection needs.
pub struct ConnectionContext {
    pub hub: Arc<Hub>,
    pub broadcaster: Arc<Broadcaster>,
    pub coordinator: Arc<EditCoordinator>,
    pub config: ConnectionConfig,
}

/// Drive one upgraded connection until it ends.
///
/// Registers the client, runs both pumps, and unregisters exactly once on
/// the way out.
pub async fn serve_connection(socket: WebSocket, info: ClientInfo, ctx: Arc<ConnectionContext>) {
    let (client, queue) = Client::with_capacity(info.clone(), ctx.config.send_queue_capacity);

    match ctx.hub.register(client).await {
        Ok(registration) => {
            ctx.broadcaster.publish(&registration.join_notice).await;
            ctx.broadcaster.publish_all(&registration.evicted).await;
        }
        Err(HubError::AlreadyRegistered(id)) => {
            log::error!("Client id {id} collided with a live connection, closing");
            return;
        }
        Err(HubError::SlowConsumer(id)) => {
            log::warn!("Client {id} could not be confirmed, closing");
            return;
        }
    }

    let departure = Departure::new(ctx.clone(), info.clone());
    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(sink, queue, ctx.config));

    let writer_done = read_pump(stream, &info, &ctx, &mut writer).await;

    departure.complete().await;

    // The queue is closed now, so the write pump flushes and exits.
    if !writer_done {
        if tokio::time::timeout(ctx.config.write_wait, &mut writer)
            .await
            .is_err()
        {
            log::debug!("Write pump for client {} did not finish, aborting", info.id);
            writer.abort();
        }
    }

    log::info!(
        "Client {} (user {}) disconnected from document {}",
        info.id,
        info.user_id,
        info.document_id
    );
}

/// Unregisters the client when dropped without [`Departure::complete`],
/// e.g. when the connection task panics or is cancelled.
struct Departure {
    ctx: Arc<ConnectionContext>,
    info: ClientInfo,
    armed: bool,
}

impl Departure {
    fn new(ctx: Arc<ConnectionContext>, info: ClientInfo) -> Self {
        Self {
            ctx,
            info,
            armed: true,
        }
    }

    async fn complete(mut self) {
        self.armed = false;
        leave(&self.ctx, &self.info).await;
    }
}

impl Drop for Departure {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let ctx = self.ctx.clone();
        let info = self.info.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { leave(&ctx, &info).await });
        }
    }
}

async fn leave(ctx: &ConnectionContext, info: &ClientInfo) {
    if let Some(departure) = ctx.hub.unregister(info.document_id, info.id).await {
        ctx.broadcaster.publish(&departure.leave_notice).await;
        ctx.broadcaster.publish_all(&departure.evicted).await;
    }
}

/// Read until the peer goes away, goes quiet, or the write pump stops.
///
/// Returns whether the write pump had already finished.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    info: &ClientInfo,
    ctx: &ConnectionContext,
    writer: &mut JoinHandle<()>,
) -> bool {
    let mut deadline = Instant::now() + ctx.config.pong_wait;

    loop {
        tokio::select! {
            _ = &mut *writer => {
                log::debug!("Write pump for client {} ended, closing reader", info.id);
                return true;
            }

            next = tokio::time::timeout_at(deadline, stream.next()) => {
                let frame = match next {
                    Err(_) => {
                        log::info!("Client {} timed out waiting for heartbeat", info.id);
                        return false;
                    }
                    Ok(None) => return false,
                    Ok(Some(Err(e))) => {
                        log::debug!("Read error from client {}: {e}", info.id);
                        return false;
                    }
                    Ok(Some(Ok(frame))) => frame,
                };

                deadline = Instant::now() + ctx.config.pong_wait;

                match frame {
                    WsMessage::Text(text) => dispatch(ctx, info, text.as_str()).await,
                    WsMessage::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => dispatch(ctx, info, text).await,
                        Err(_) => log::warn!("Client {} sent non-UTF-8 binary frame", info.id),
                    },
                    WsMessage::Pong(_) => log::trace!("Heartbeat from client {}", info.id),
                    WsMessage::Ping(_) => {}
                    WsMessage::Close(_) => return false,
                }
            }
        }
    }
}

/// Route one inbound envelope.
async fn dispatch(ctx: &ConnectionContext, info: &ClientInfo, text: &str) {
    let mut message = match Message::parse(text) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Dropping frame from client {}: {e}", info.id);
            return;
        }
    };

    // Identity comes from the connection, never from the client.
    message.document_id = info.document_id;
    message.user_id = info.user_id;

    match message.kind {
        MessageType::Edit => {
            if !info.permission.can_edit() {
                log::warn!(
                    "User {} has {} access to document {}, dropping edit",
                    info.user_id,
                    info.permission,
                    info.document_id
                );
                return;
            }
            match ctx.coordinator.apply_edit(message).await {
                Ok(_) => {}
                Err(e @ EditError::Store(_)) | Err(e @ EditError::VersionContention { .. }) => {
                    log::error!(
                        "Edit from user {} on document {} not committed: {e}",
                        info.user_id,
                        info.document_id
                    );
                }
                Err(e) => log::warn!("Dropping edit from client {}: {e}", info.id),
            }
        }
        MessageType::Cursor => {
            ctx.broadcaster.deliver(&message).await;
        }
        other => {
            log::warn!("Ignoring {other} message from client {}", info.id);
        }
    }
}

/// Drain the client's queue onto the socket and keep it alive with pings.
///
/// Frames already queued when a write starts go out together as one text
/// message, separated by `'\n'`.
async fn write_pump<S>(mut sink: S, mut queue: mpsc::Receiver<Frame>, config: ConnectionConfig)
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(first) = next else {
                    // Hub closed the queue: say goodbye and stop.
                    if !send(&mut sink, WsMessage::Close(None), &config).await {
                        log::debug!("Close frame not delivered after queue closed");
                    }
                    return;
                };

                let mut batch = String::from(&*first);
                let backlog = queue.len();
                for _ in 0..backlog {
                    match queue.try_recv() {
                        Ok(frame) => {
                            batch.push('\n');
                            batch.push_str(&frame);
                        }
                        Err(_) => break,
                    }
                }

                if !send(&mut sink, WsMessage::Text(batch.into()), &config).await {
                    return;
                }
            }

            _ = heartbeat.tick() => {
                if !send(&mut sink, WsMessage::Ping(Bytes::new()), &config).await {
                    return;
                }
            }
        }
    }
}

/// One write bounded by `write_wait`. Returns false if the connection is unusable.
async fn send<S>(sink: &mut S, message: WsMessage, config: &ConnectionConfig) -> bool
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    match tokio::time::timeout(config.write_wait, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::debug!("Write failed: {e}");
            false
        }
        Err(_) => {
            log::debug!("Write timed out after {:?}", config.write_wait);
            false
        }
    }
}
