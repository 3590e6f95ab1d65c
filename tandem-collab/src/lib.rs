//! # tandem-collab — Real-time collaborative text editing engine
//!
//! Keeps every client connected to a document in sync: edits are versioned,
//! persisted and applied to the document snapshot, then fanned out to all
//! collaborators, on this instance and on sibling instances.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌──────────────────┐
//! │  Client A   │ ◄──────────────► │ connection pumps │──┐
//! └─────────────┘   JSON frames    └────────┬─────────┘  │ cursor
//!                                           │ edit       ▼
//!                                  ┌────────▼────────┐  ┌─────────────┐
//!                                  │ EditCoordinator │─►│ Broadcaster │
//!                                  └────────┬────────┘  └──┬───────┬──┘
//!                                           │              │       │
//!                                  ┌────────▼────────┐  ┌──▼──┐ ┌──▼────────┐
//!                                  │ DocumentStore / │  │ Hub │ │ FanoutBus │
//!                                  │ EventLog        │  └─────┘ └───────────┘
//!                                  └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope, message types, permissions
//! - [`edit`] — insert/delete operations on document text
//! - [`hub`] — per-document client registry and non-blocking broadcast
//! - [`connection`] — per-client read and write pumps
//! - [`coordinator`] — edit versioning, persistence and distribution
//! - [`access`] — ownership and collaborator checks
//! - [`auth`] — credential verification
//! - [`bus`] — cross-instance fan-out
//! - [`storage`] — document and event log backends
//! - [`config`] — server configuration
//! - [`server`] — HTTP upgrade route and server wiring

pub mod access;
pub mod auth;
pub mod bus;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod edit;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use access::{AccessError, AccessGate};
pub use auth::{issue_token, AuthError, Authenticator, JwtAuthenticator, StaticTokens};
pub use bus::{
    BusError, BusRelay, Broadcaster, FanoutBus, LocalBroker, LocalBus, RedisBus, RelayBus,
    RelayConfig,
};
pub use config::{ConfigError, ConnectionConfig, ServerConfig};
pub use coordinator::{EditCoordinator, EditError};
pub use edit::{EditOperation, EditPayload};
pub use hub::{BroadcastReport, Client, ClientInfo, Hub, HubError, HubStats};
pub use protocol::{
    ClientId, DocumentId, Message, MessageType, Permission, ProtocolError, UserId,
};
pub use server::{Backends, ServerError, ServerStats, SyncServer};
pub use storage::{
    Collaborator, Document, DocumentStore, EditEvent, EventLog, Head, MemoryStore, RocksStore,
    StoreConfig, StoreError,
};
