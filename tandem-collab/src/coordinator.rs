//! Versioned edit pipeline.
//!
//! ```text
//! edit envelope
//!     │ decode payload (bad JSON / unknown op → dropped)
//!     ▼
//! ┌── per-document section ─────────────────────────────┐
//! │ read head: snapshot + latest version                │
//! │   (unknown document → dropped)                      │
//! │ version = latest + 1                                │
//! │ content = apply(edit, snapshot)                     │
//! │ commit event + content together                     │
//! │   (conflict → re-read head, retry)                  │
//! │ broadcast locally + publish on the bus              │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The section is an async mutex per document id, so edits to different
//! documents never wait on each other. Broadcasting inside the section keeps
//! the order clients observe identical to version order. Across processes
//! the store's [`EventLog::commit_edit`] is the serialization point: it only
//! accepts the version right after the one the snapshot was read at, so an
//! instance that lost the race re-applies its edit to the newer snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::bus::Broadcaster;
use crate::edit::{EditOperation, EditPayload};
use crate::protocol::{unix_timestamp, DocumentId, Message, MessageType};
use crate::storage::{EditEvent, EventLog, StoreError, EDIT_EVENT};

/// Default page size for [`EditCoordinator::history`].
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Largest page [`EditCoordinator::history`] returns.
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Edit pipeline errors. None of them are reported to the client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EditError {
    #[error("not an edit message: {0}")]
    NotAnEdit(MessageType),
    #[error("invalid edit payload: {0}")]
    Decode(String),
    #[error("unknown edit operation: {0}")]
    UnknownOperation(String),
    #[error("document {document_id}: no free version after {attempts} attempts")]
    VersionContention { document_id: DocumentId, attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Payload stored with each committed edit.
#[derive(Debug, Serialize)]
struct PersistedEdit<'a> {
    version: u64,
    timestamp: i64,
    #[serde(flatten)]
    edit: &'a EditPayload,
}

/// One async mutex per document, created on demand.
#[derive(Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    async fn acquire(&self, document_id: DocumentId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Only this map holds an idle lock; nobody is waiting on it.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(document_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Assigns versions, persists, applies, and distributes edits.
pub struct EditCoordinator {
    events: Arc<dyn EventLog>,
    broadcaster: Arc<Broadcaster>,
    locks: DocumentLocks,
    max_attempts: u32,
}

impl EditCoordinator {
    pub fn new(events: Arc<dyn EventLog>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            events,
            broadcaster,
            locks: DocumentLocks::default(),
            max_attempts: 3,
        }
    }

    /// Attempts to find a free version before giving up.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Commit one edit and distribute it.
    ///
    /// `message.document_id` and `message.user_id` must already be the
    /// authenticated values. Returns the version-stamped message as sent to
    /// clients. On any error nothing is applied or broadcast.
    pub async fn apply_edit(&self, mut message: Message) -> Result<Message, EditError> {
        if message.kind != MessageType::Edit {
            return Err(EditError::NotAnEdit(message.kind));
        }
        let payload: EditPayload = serde_json::from_value(message.payload.clone())
            .map_err(|e| EditError::Decode(e.to_string()))?;
        let operation = payload
            .operation()
            .ok_or_else(|| EditError::UnknownOperation(payload.operation.clone()))?;

        let document_id = message.document_id;
        message.timestamp = unix_timestamp();
        message.payload =
            serde_json::to_value(&payload).map_err(|e| EditError::Decode(e.to_string()))?;

        let _section = self.locks.acquire(document_id).await;

        let version = self.commit(&message, &payload, &operation).await?;
        message.version = version;

        log::debug!(
            "Document {document_id} v{version}: {} by user {}",
            operation.name(),
            message.user_id
        );

        self.broadcaster.deliver(&message).await;
        Ok(message)
    }

    /// Read the head, apply the edit to it, and commit the next version with
    /// the new snapshot, starting over from a fresh head when another writer
    /// got there first.
    async fn commit(
        &self,
        message: &Message,
        payload: &EditPayload,
        operation: &EditOperation,
    ) -> Result<u64, EditError> {
        let document_id = message.document_id;

        for attempt in 1..=self.max_attempts {
            // Unknown documents fail here, before a version is spent.
            let head = self.events.head(document_id).await?;
            let version = head.version + 1;
            let record = PersistedEdit {
                version,
                timestamp: message.timestamp,
                edit: payload,
            };
            let event = EditEvent {
                document_id,
                user_id: message.user_id,
                event_type: EDIT_EVENT.to_string(),
                version,
                payload: serde_json::to_value(&record)
                    .map_err(|e| EditError::Decode(e.to_string()))?,
                created_at: unix_timestamp(),
            };

            let updated = operation.apply(&head.content);

            match self.events.commit_edit(&event, &updated).await {
                Ok(()) => return Ok(version),
                Err(StoreError::VersionConflict { .. }) => {
                    log::debug!(
                        "Version {version} of document {document_id} taken (attempt {attempt})"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EditError::VersionContention {
            document_id,
            attempts: self.max_attempts,
        })
    }

    /// Highest committed version of a document.
    pub async fn current_version(&self, document_id: DocumentId) -> Result<u64, EditError> {
        Ok(self.events.latest_version(document_id).await?)
    }

    /// Committed edits, newest first. `limit` of 0 means the default page;
    /// larger pages are capped.
    pub async fn history(
        &self,
        document_id: DocumentId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EditEvent>, EditError> {
        let limit = match limit {
            0 => DEFAULT_HISTORY_LIMIT,
            n => n.min(MAX_HISTORY_LIMIT),
        };
        Ok(self.events.events(document_id, limit, offset).await?)
    }
}
