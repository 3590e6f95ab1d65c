//! Storage contracts for documents, collaborators, and the edit log.
//!
//! Two backends implement them:
//! - [`memory::MemoryStore`] — in-process maps, used by tests and ephemeral servers
//! - [`rocks::RocksStore`] — RocksDB with LZ4-compressed document content
//!
//! The sync engine only ever talks to the traits, so the relational store of a
//! larger deployment can be slotted in without touching the hub or pumps.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocol::{unix_timestamp, DocumentId, Permission, UserId};

/// Event type recorded for text edits.
pub const EDIT_EVENT: &str = "edit";

/// A document row. `content` is the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
    pub content_type: String,
    pub owner_id: UserId,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    pub fn new(id: DocumentId, title: impl Into<String>, owner_id: UserId) -> Self {
        let now = unix_timestamp();
        Self {
            id,
            title: title.into(),
            content: String::new(),
            content_type: "text/plain".to_string(),
            owner_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A non-owner's grant on a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub permission: Permission,
    pub created_at: i64,
}

/// One committed, versioned mutation. Never updated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditEvent {
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub event_type: String,
    pub version: u64,
    /// JSON record of the edit, including version, timestamp, and operation
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// A document's snapshot together with the version it reflects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub content: String,
    /// Latest committed version, 0 before the first edit
    pub version: u64,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),
    #[error("version {version} already committed for document {document_id}")]
    VersionConflict { document_id: DocumentId, version: u64 },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Documents and their access grants.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create an empty `text/plain` document owned by `owner_id`.
    async fn create_document(&self, title: &str, owner_id: UserId) -> Result<Document, StoreError>;

    async fn document(&self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    /// Current snapshot. Fails with `DocumentNotFound` for an unknown id.
    async fn content(&self, id: DocumentId) -> Result<String, StoreError>;

    /// Replace the snapshot and bump `updated_at`.
    async fn set_content(&self, id: DocumentId, content: &str) -> Result<(), StoreError>;

    async fn owner(&self, id: DocumentId) -> Result<Option<UserId>, StoreError>;

    async fn collaborator_permission(
        &self,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<Option<Permission>, StoreError>;

    /// Insert or update a grant.
    async fn upsert_collaborator(
        &self,
        document_id: DocumentId,
        user_id: UserId,
        permission: Permission,
    ) -> Result<(), StoreError>;

    /// Returns whether a grant existed.
    async fn remove_collaborator(
        &self,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<bool, StoreError>;

    async fn collaborators(&self, document_id: DocumentId) -> Result<Vec<Collaborator>, StoreError>;
}

/// Append-only, per-document versioned edit log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Highest committed version, 0 when the document has no events.
    async fn latest_version(&self, document_id: DocumentId) -> Result<u64, StoreError>;

    /// Append an event. Fails with `VersionConflict` if its version exists.
    async fn append(&self, event: &EditEvent) -> Result<(), StoreError>;

    /// Snapshot and latest version, read as one consistent pair.
    /// Fails with `DocumentNotFound` for an unknown id.
    async fn head(&self, document_id: DocumentId) -> Result<Head, StoreError>;

    /// Append `event` and replace the snapshot with `content` atomically.
    ///
    /// Fails with `VersionConflict` unless `event.version` is exactly one past
    /// the latest committed version, so `content` is always derived from the
    /// snapshot it replaces, whichever process wrote it.
    async fn commit_edit(&self, event: &EditEvent, content: &str) -> Result<(), StoreError>;

    /// Events newest first.
    async fn events(
        &self,
        document_id: DocumentId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EditEvent>, StoreError>;
}
