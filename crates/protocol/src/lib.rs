//! CoEdit Wire Protocol — v1 Frozen Wire Format
//!
//! This crate defines the canonical message types exchanged between editor
//! clients and the collaboration server, plus the frame codec that carries
//! them. The wire format is length-prefixed JSON over a stream socket:
//!
//! ```text
//! <decimal-ascii-length>!<json-payload>
//! ```
//!
//! # Protocol Version
//!
//! This is **protocol v1** — the wire format is frozen. Changes require:
//! 1. Version bump in PROTOCOL_VERSION
//! 2. Backward compatibility handling in the server dispatch
//!
//! # Usage
//!
//! ```ignore
//! use coedit_protocol::{ClientRequest, ServerMessage, framing};
//!
//! framing::send_message(&mut stream, &ClientRequest::ListDocuments)?;
//! let reply: ServerMessage = framing::decode(&frame)?;
//! ```

pub mod framing;

use coedit_engine::Operation;
use serde::{Deserialize, Serialize};

pub use framing::{FrameError, FrameReader, MAX_FRAME_SIZE};

/// Current protocol version. Increment for breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Client → Server Messages
// =============================================================================

/// Messages sent from an editor client to the collaboration server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    SignUp(SignUpRequest),
    LogIn(LogInRequest),
    LogOut,
    ListDocuments,
    CreateDocument(CreateDocumentRequest),
    RenameDocument(RenameDocumentRequest),
    DeleteDocument(DeleteDocumentRequest),
    OpenDocument(OpenDocumentRequest),
    CloseDocument(CloseDocumentRequest),
    UpdateContent(UpdateContentRequest),
    QueryAccess(QueryAccessRequest),
    SetAccess(SetAccessRequest),
    ResolveUser(ResolveUserRequest),
}

/// Request to create a new account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub username: String,
    pub password: String,
}

/// Request to authenticate this connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogInRequest {
    pub username: String,
    pub password: String,
}

/// Request to create a new document owned by the logged-in user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDocumentRequest {
    pub name: String,
}

/// Request to rename a document. Owner only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameDocumentRequest {
    pub doc: i64,
    pub new_name: String,
}

/// Request to delete a document. Owner only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDocumentRequest {
    pub doc: i64,
}

/// Request to open a document for collaborative editing.
/// The server replies with a content snapshot and registers a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenDocumentRequest {
    pub doc: i64,
}

/// Request to close an open document without disconnecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseDocumentRequest {
    pub doc: i64,
}

/// An edit batch produced by the client-side diff generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateContentRequest {
    pub doc: i64,
    pub ops: Vec<Operation>,
}

/// Request the grant list for a document. Owner only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAccessRequest {
    pub doc: i64,
}

/// Create or update an access grant for (user, document). Owner only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAccessRequest {
    pub doc: i64,
    pub username: String,
    pub can_read: bool,
    pub can_write: bool,
}

/// Look up a user by name (e.g. before granting access).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveUserRequest {
    pub username: String,
}

// =============================================================================
// Server → Client Messages
// =============================================================================

/// Messages sent from the collaboration server to editor clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SignUpResult(SignUpResult),
    LogInResult(LogInResult),
    LogOutResult(LogOutResult),
    DocumentList(DocumentList),
    DocumentCreated(DocumentCreated),
    DocumentRenamed(DocumentRenamed),
    DocumentDeleted(DocumentDeleted),
    ContentSnapshot(ContentSnapshot),
    ContentUpdate(ContentUpdate),
    UpdateRejected(UpdateRejected),
    AccessInfo(AccessInfo),
    AccessUpdated(AccessUpdated),
    UserResolved(UserResolved),
    Error(ErrorMessage),
}

/// Result of a sign-up request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignUpResult {
    pub ok: bool,
    pub message: String,
}

/// Result of a log-in request. `user` is present on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogInResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

/// Result of a log-out request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOutResult {
    pub ok: bool,
}

/// Documents readable by the logged-in user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentList {
    pub documents: Vec<DocumentInfo>,
}

/// Result of a create-document request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentCreated {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentInfo>,
}

/// Result of a rename-document request; also pushed to other open sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRenamed {
    pub ok: bool,
    pub doc: i64,
    pub name: String,
}

/// Result of a delete-document request; also pushed to evicted sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDeleted {
    pub ok: bool,
    pub doc: i64,
}

/// Full document content, pushed when a document is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSnapshot {
    pub doc: i64,
    pub content: String,
}

/// An edit batch broadcast to the other sessions on a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentUpdate {
    pub doc: i64,
    pub ops: Vec<Operation>,
}

/// Write-rejected signal: an update was attempted without write access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRejected {
    pub doc: i64,
    pub reason: String,
}

/// Grant list for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessInfo {
    pub doc: i64,
    pub grants: Vec<GrantInfo>,
}

/// Result of a set-access request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessUpdated {
    pub ok: bool,
    pub message: String,
}

/// Result of a resolve-user request. `user` is absent when unknown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResolved {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

/// Error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

// =============================================================================
// Shared Types
// =============================================================================

/// A user as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
}

/// Document metadata as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub id: i64,
    pub name: String,
    pub owner: String,
    pub created_at: String,
}

/// One access grant row as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantInfo {
    pub username: String,
    pub can_read: bool,
    pub can_write: bool,
}

impl ErrorMessage {
    /// Connection is not authenticated.
    pub fn auth_required() -> Self {
        Self {
            code: "auth_required".to_string(),
            message: "Log in before issuing document requests".to_string(),
        }
    }

    /// The requesting user lacks the required permission.
    pub fn access_denied() -> Self {
        Self {
            code: "access_denied".to_string(),
            message: "Access denied".to_string(),
        }
    }

    /// The referenced document or user does not exist.
    pub fn not_found() -> Self {
        Self {
            code: "not_found".to_string(),
            message: "Not found".to_string(),
        }
    }

    /// The frame could not be decoded as a known request.
    pub fn malformed() -> Self {
        Self {
            code: "malformed_message".to_string(),
            message: "Message could not be parsed".to_string(),
        }
    }

    /// A store-layer operation failed.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: "internal_error".to_string(),
            message: message.into(),
        }
    }
}
