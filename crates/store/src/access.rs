// Permission checks over a document store.

use std::sync::Arc;

use crate::{Access, DocId, DocumentStore, StoreError, UserId};

/// Result of gating one operation on one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome<T> {
    Granted(T),
    Denied,
    /// The document does not exist. Distinct from [`GateOutcome::Denied`] so
    /// callers can answer "not found" instead of leaking a permission error.
    Missing,
}

/// Resolves effective rights: the owner has implicit full access, everyone
/// else gets their grant row or nothing.
#[derive(Clone)]
pub struct AccessGate {
    store: Arc<dyn DocumentStore>,
}

impl AccessGate {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Effective rights of `user` on `doc`, or `None` if the document does
    /// not exist.
    pub fn effective(&self, doc: DocId, user: UserId) -> Result<Option<Access>, StoreError> {
        let Some(document) = self.store.document(doc)? else {
            return Ok(None);
        };
        if document.owner == user {
            return Ok(Some(Access::FULL));
        }
        Ok(Some(self.store.access_for(doc, user)?.unwrap_or(Access::NONE)))
    }

    pub fn is_owner(&self, doc: DocId, user: UserId) -> Result<GateOutcome<()>, StoreError> {
        match self.store.document(doc)? {
            None => Ok(GateOutcome::Missing),
            Some(document) if document.owner == user => Ok(GateOutcome::Granted(())),
            Some(_) => Ok(GateOutcome::Denied),
        }
    }

    pub fn can_read(&self, doc: DocId, user: UserId) -> Result<GateOutcome<()>, StoreError> {
        match self.effective(doc, user)? {
            None => Ok(GateOutcome::Missing),
            Some(access) if access.can_read => Ok(GateOutcome::Granted(())),
            Some(_) => Ok(GateOutcome::Denied),
        }
    }

    pub fn can_write(&self, doc: DocId, user: UserId) -> Result<GateOutcome<()>, StoreError> {
        match self.effective(doc, user)? {
            None => Ok(GateOutcome::Missing),
            Some(access) if access.can_write => Ok(GateOutcome::Granted(())),
            Some(_) => Ok(GateOutcome::Denied),
        }
    }

    /// Gated content read: the document body if the user may read it.
    pub fn read_content(
        &self,
        doc: DocId,
        user: UserId,
    ) -> Result<GateOutcome<String>, StoreError> {
        match self.can_read(doc, user)? {
            GateOutcome::Granted(()) => match self.store.get_content(doc)? {
                Some(content) => Ok(GateOutcome::Granted(content)),
                None => Ok(GateOutcome::Missing),
            },
            GateOutcome::Denied => Ok(GateOutcome::Denied),
            GateOutcome::Missing => Ok(GateOutcome::Missing),
        }
    }
}
