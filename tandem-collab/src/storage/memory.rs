//! In-process store backed by ordered maps.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Collaborator, Document, DocumentStore, EditEvent, EventLog, Head, StoreError};
use crate::protocol::{unix_timestamp, DocumentId, Permission, UserId};

#[derive(Default)]
struct Tables {
    documents: BTreeMap<DocumentId, Document>,
    collaborators: BTreeMap<(DocumentId, UserId), Collaborator>,
    events: BTreeMap<(DocumentId, u64), EditEvent>,
    next_id: DocumentId,
}

impl Tables {
    fn latest_version(&self, document_id: DocumentId) -> u64 {
        self.events
            .range((document_id, 0)..=(document_id, u64::MAX))
            .next_back()
            .map_or(0, |((_, version), _)| *version)
    }
}

/// Volatile store; everything is lost when dropped.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document with a caller-chosen id, replacing any existing row.
    pub async fn insert_document(&self, document: Document) {
        let mut tables = self.tables.write().await;
        tables.next_id = tables.next_id.max(document.id);
        tables.documents.insert(document.id, document);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_document(&self, title: &str, owner_id: UserId) -> Result<Document, StoreError> {
        let mut tables = self.tables.write().await;
        tables.next_id += 1;
        let document = Document::new(tables.next_id, title, owner_id);
        tables.documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.tables.read().await.documents.get(&id).cloned())
    }

    async fn content(&self, id: DocumentId) -> Result<String, StoreError> {
        self.tables
            .read()
            .await
            .documents
            .get(&id)
            .map(|d| d.content.clone())
            .ok_or(StoreError::DocumentNotFound(id))
    }

    async fn set_content(&self, id: DocumentId, content: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let document = tables
            .documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))?;
        document.content = content.to_string();
        document.updated_at = unix_timestamp();
        Ok(())
    }

    async fn owner(&self, id: DocumentId) -> Result<Option<UserId>, StoreError> {
        Ok(self.tables.read().await.documents.get(&id).map(|d| d.owner_id))
    }

    async fn collaborator_permission(
        &self,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<Option<Permission>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .collaborators
            .get(&(document_id, user_id))
            .map(|c| c.permission))
    }

    async fn upsert_collaborator(
        &self,
        document_id: DocumentId,
        user_id: UserId,
        permission: Permission,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.documents.contains_key(&document_id) {
            return Err(StoreError::DocumentNotFound(document_id));
        }
        tables
            .collaborators
            .entry((document_id, user_id))
            .and_modify(|c| c.permission = permission)
            .or_insert_with(|| Collaborator {
                document_id,
                user_id,
                permission,
                created_at: unix_timestamp(),
            });
        Ok(())
    }

    async fn remove_collaborator(
        &self,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        Ok(tables.collaborators.remove(&(document_id, user_id)).is_some())
    }

    async fn collaborators(&self, document_id: DocumentId) -> Result<Vec<Collaborator>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .collaborators
            .range((document_id, UserId::MIN)..=(document_id, UserId::MAX))
            .map(|(_, c)| c.clone())
            .collect())
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn latest_version(&self, document_id: DocumentId) -> Result<u64, StoreError> {
        Ok(self.tables.read().await.latest_version(document_id))
    }

    async fn append(&self, event: &EditEvent) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let key = (event.document_id, event.version);
        if tables.events.contains_key(&key) {
            return Err(StoreError::VersionConflict {
                document_id: event.document_id,
                version: event.version,
            });
        }
        tables.events.insert(key, event.clone());
        Ok(())
    }

    async fn head(&self, document_id: DocumentId) -> Result<Head, StoreError> {
        let tables = self.tables.read().await;
        let document = tables
            .documents
            .get(&document_id)
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        Ok(Head {
            content: document.content.clone(),
            version: tables.latest_version(document_id),
        })
    }

    async fn commit_edit(&self, event: &EditEvent, content: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let document_id = event.document_id;
        if !tables.documents.contains_key(&document_id) {
            return Err(StoreError::DocumentNotFound(document_id));
        }
        if event.version != tables.latest_version(document_id) + 1 {
            return Err(StoreError::VersionConflict {
                document_id,
                version: event.version,
            });
        }

        tables.events.insert((document_id, event.version), event.clone());
        if let Some(document) = tables.documents.get_mut(&document_id) {
            document.content = content.to_string();
            document.updated_at = unix_timestamp();
        }
        Ok(())
    }

    async fn events(
        &self,
        document_id: DocumentId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EditEvent>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .range((document_id, 0)..=(document_id, u64::MAX))
            .rev()
            .skip(offset)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }
}
