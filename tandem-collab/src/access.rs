//! Authorization against the document store.
//!
//! A user may open a document if they own it or hold any collaborator grant.
//! Only the owner manages grants. Every check reads the store, so a revoked
//! grant takes effect on the next connection attempt.

use std::sync::Arc;

use crate::protocol::{DocumentId, Permission, UserId};
use crate::storage::{Collaborator, DocumentStore, StoreError};

/// Access errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccessError {
    #[error("user {user_id} has no access to document {document_id}")]
    Denied {
        user_id: UserId,
        document_id: DocumentId,
    },
    #[error("user {user_id} has {actual} access, {required} required")]
    Insufficient {
        user_id: UserId,
        actual: Permission,
        required: Permission,
    },
    #[error("only the owner can manage collaborators")]
    NotOwner,
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),
    #[error("invalid collaborator permission: {0}")]
    InvalidPermission(Permission),
    #[error("collaborator not found")]
    CollaboratorNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ownership and collaborator checks.
#[derive(Clone)]
pub struct AccessGate {
    documents: Arc<dyn DocumentStore>,
}

impl AccessGate {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    /// Owner or collaborator at any level.
    pub async fn has_access(
        &self,
        user_id: UserId,
        document_id: DocumentId,
    ) -> Result<bool, StoreError> {
        Ok(self.permission(user_id, document_id).await?.is_some())
    }

    pub async fn is_owner(
        &self,
        user_id: UserId,
        document_id: DocumentId,
    ) -> Result<bool, StoreError> {
        Ok(self.documents.owner(document_id).await? == Some(user_id))
    }

    /// Effective permission: `owner` for the owner, the grant for a
    /// collaborator, `None` otherwise.
    pub async fn permission(
        &self,
        user_id: UserId,
        document_id: DocumentId,
    ) -> Result<Option<Permission>, StoreError> {
        if self.is_owner(user_id, document_id).await? {
            return Ok(Some(Permission::Owner));
        }
        self.documents
            .collaborator_permission(document_id, user_id)
            .await
    }

    /// Fail unless the user holds at least `required`.
    pub async fn require(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        required: Permission,
    ) -> Result<Permission, AccessError> {
        let actual = self
            .permission(user_id, document_id)
            .await?
            .ok_or(AccessError::Denied {
                user_id,
                document_id,
            })?;
        if !actual.satisfies(required) {
            return Err(AccessError::Insufficient {
                user_id,
                actual,
                required,
            });
        }
        Ok(actual)
    }

    /// Grant or change a collaborator's access. Owner only.
    pub async fn add_collaborator(
        &self,
        actor: UserId,
        document_id: DocumentId,
        user_id: UserId,
        permission: Permission,
    ) -> Result<(), AccessError> {
        if permission == Permission::Owner {
            return Err(AccessError::InvalidPermission(permission));
        }
        self.require_owner(actor, document_id).await?;
        if user_id == actor {
            return Err(AccessError::InvalidPermission(permission));
        }
        self.documents
            .upsert_collaborator(document_id, user_id, permission)
            .await?;
        log::info!("User {user_id} granted {permission} on document {document_id}");
        Ok(())
    }

    /// Revoke a collaborator's access. Owner only.
    pub async fn remove_collaborator(
        &self,
        actor: UserId,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<(), AccessError> {
        self.require_owner(actor, document_id).await?;
        if !self
            .documents
            .remove_collaborator(document_id, user_id)
            .await?
        {
            return Err(AccessError::CollaboratorNotFound);
        }
        log::info!("User {user_id} removed from document {document_id}");
        Ok(())
    }

    /// List grants. Any user with access may look.
    pub async fn collaborators(
        &self,
        actor: UserId,
        document_id: DocumentId,
    ) -> Result<Vec<Collaborator>, AccessError> {
        self.require(actor, document_id, Permission::View).await?;
        Ok(self.documents.collaborators(document_id).await?)
    }

    async fn require_owner(&self, actor: UserId, document_id: DocumentId) -> Result<(), AccessError> {
        match self.documents.owner(document_id).await? {
            None => Err(AccessError::DocumentNotFound(document_id)),
            Some(owner) if owner == actor => Ok(()),
            Some(_) => Err(AccessError::NotOwner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    const OWNER: UserId = 1;
    const EDITOR: UserId = 2;
    const VIEWER: UserId = 3;
    const STRANGER: UserId = 4;

    async fn setup() -> (AccessGate, DocumentId) {
        let store = Arc::new(MemoryStore::new());
        let doc = store.create_document("Shared", OWNER).await.unwrap();
        let gate = AccessGate::new(store);
        gate.add_collaborator(OWNER, doc.id, EDITOR, Permission::Edit)
            .await
            .unwrap();
        gate.add_collaborator(OWNER, doc.id, VIEWER, Permission::View)
            .await
            .unwrap();
        (gate, doc.id)
    }

    #[tokio::test]
    async fn test_has_access() {
        let (gate, doc) = setup().await;
        assert!(gate.has_access(OWNER, doc).await.unwrap());
        assert!(gate.has_access(EDITOR, doc).await.unwrap());
        assert!(gate.has_access(VIEWER, doc).await.unwrap());
        assert!(!gate.has_access(STRANGER, doc).await.unwrap());
        assert!(!gate.has_access(OWNER, doc + 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_effective_permission() {
        let (gate, doc) = setup().await;
        assert_eq!(gate.permission(OWNER, doc).await.unwrap(), Some(Permission::Owner));
        assert_eq!(gate.permission(EDITOR, doc).await.unwrap(), Some(Permission::Edit));
        assert_eq!(gate.permission(VIEWER, doc).await.unwrap(), Some(Permission::View));
        assert_eq!(gate.permission(STRANGER, doc).await.unwrap(), None);
        assert!(gate.is_owner(OWNER, doc).await.unwrap());
        assert!(!gate.is_owner(EDITOR, doc).await.unwrap());
    }

    #[tokio::test]
    async fn test_edit_requirement_rejects_viewer() {
        let (gate, doc) = setup().await;
        assert!(gate.require(OWNER, doc, Permission::Edit).await.is_ok());
        assert!(gate.require(EDITOR, doc, Permission::Edit).await.is_ok());
        assert_eq!(
            gate.require(VIEWER, doc, Permission::Edit).await.unwrap_err(),
            AccessError::Insufficient {
                user_id: VIEWER,
                actual: Permission::View,
                required: Permission::Edit,
            }
        );
        assert!(matches!(
            gate.require(STRANGER, doc, Permission::View).await,
            Err(AccessError::Denied { .. })
        ));
    }

    #[tokio::test]
    async fn test_only_owner_manages_collaborators() {
        let (gate, doc) = setup().await;
        assert_eq!(
            gate.add_collaborator(EDITOR, doc, STRANGER, Permission::View)
                .await
                .unwrap_err(),
            AccessError::NotOwner
        );
        assert_eq!(
            gate.remove_collaborator(VIEWER, doc, EDITOR).await.unwrap_err(),
            AccessError::NotOwner
        );
        assert_eq!(
            gate.add_collaborator(OWNER, doc + 1, STRANGER, Permission::View)
                .await
                .unwrap_err(),
            AccessError::DocumentNotFound(doc + 1)
        );
    }

    #[tokio::test]
    async fn test_grant_update_and_revoke() {
        let (gate, doc) = setup().await;
        gate.add_collaborator(OWNER, doc, VIEWER, Permission::Edit)
            .await
            .unwrap();
        assert_eq!(gate.permission(VIEWER, doc).await.unwrap(), Some(Permission::Edit));

        gate.remove_collaborator(OWNER, doc, VIEWER).await.unwrap();
        assert!(!gate.has_access(VIEWER, doc).await.unwrap());
        assert_eq!(
            gate.remove_collaborator(OWNER, doc, VIEWER).await.unwrap_err(),
            AccessError::CollaboratorNotFound
        );
    }

    #[tokio::test]
    async fn test_owner_grant_rejected() {
        let (gate, doc) = setup().await;
        assert_eq!(
            gate.add_collaborator(OWNER, doc, STRANGER, Permission::Owner)
                .await
                .unwrap_err(),
            AccessError::InvalidPermission(Permission::Owner)
        );
    }

    #[tokio::test]
    async fn test_collaborator_listing_requires_access() {
        let (gate, doc) = setup().await;
        assert_eq!(gate.collaborators(VIEWER, doc).await.unwrap().len(), 2);
        assert!(gate.collaborators(STRANGER, doc).await.is_err());
    }
}
