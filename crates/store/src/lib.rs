//! Document persistence: users, documents, content, and access grants.
//!
//! Everything above this crate talks to the [`DocumentStore`] trait; the
//! shipped backend is [`SqliteStore`]. Permission decisions live in
//! [`AccessGate`], which wraps a store and resolves the owner's implicit
//! full rights plus per-user grant rows.

use std::fmt;

mod access;
mod sqlite;

pub use access::{AccessGate, GateOutcome};
pub use sqlite::SqliteStore;

pub type UserId = i64;
pub type DocId = i64;

/// A registered account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

/// Document metadata. `owner_name` is denormalized from the users table so
/// listings don't need a second lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocId,
    pub name: String,
    pub owner: UserId,
    pub owner_name: String,
    /// RFC 3339, UTC.
    pub created_at: String,
}

/// Effective rights of one user on one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Access {
    pub can_read: bool,
    pub can_write: bool,
}

impl Access {
    pub const FULL: Access = Access {
        can_read: true,
        can_write: true,
    };
    pub const NONE: Access = Access {
        can_read: false,
        can_write: false,
    };
}

/// One explicit grant row, resolved to a username for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub username: String,
    pub access: Access,
}

#[derive(Debug)]
pub enum StoreError {
    /// Uniqueness or referential-integrity violation (duplicate username,
    /// grant for an unknown user, ...).
    Conflict(String),
    /// Anything the backend reports that isn't a constraint conflict.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Backend(msg) => write!(f, "store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// Persistence boundary for the collaboration server.
///
/// Credential strings are treated as opaque: callers hash before storing
/// and pass the same form to [`DocumentStore::verify_credentials`].
pub trait DocumentStore: Send + Sync {
    fn add_user(&self, username: &str, secret: &str) -> Result<User, StoreError>;
    fn verify_credentials(&self, username: &str, secret: &str)
        -> Result<Option<User>, StoreError>;
    fn resolve_user(&self, username: &str) -> Result<Option<User>, StoreError>;

    fn document(&self, doc: DocId) -> Result<Option<Document>, StoreError>;
    /// Documents the user owns or has an explicit read grant on.
    fn list_documents(&self, user: UserId) -> Result<Vec<Document>, StoreError>;
    fn create_document(&self, name: &str, owner: UserId) -> Result<Document, StoreError>;
    fn rename_document(&self, doc: DocId, name: &str) -> Result<(), StoreError>;
    /// Removes the document, its content, and all grant rows.
    fn delete_document(&self, doc: DocId) -> Result<(), StoreError>;

    fn get_content(&self, doc: DocId) -> Result<Option<String>, StoreError>;
    fn save_content(&self, doc: DocId, content: &str) -> Result<(), StoreError>;

    /// The explicit grant row for (doc, user), if any. Owner rights are not
    /// represented as rows; use [`AccessGate`] for effective rights.
    fn access_for(&self, doc: DocId, user: UserId) -> Result<Option<Access>, StoreError>;
    fn set_access(&self, doc: DocId, user: UserId, access: Access) -> Result<(), StoreError>;
    fn grants_for(&self, doc: DocId) -> Result<Vec<Grant>, StoreError>;
}
