// End-to-end collaboration scenarios: real server, real sockets, two
// clients editing one document through the batch-broadcast path.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use coedit_client::{Client, EditorBuffer};
use coedit_protocol::{
    ClientRequest, CreateDocumentRequest, DeleteDocumentRequest, LogInRequest,
    OpenDocumentRequest, RenameDocumentRequest, ServerMessage, SetAccessRequest, SignUpRequest,
    UpdateContentRequest,
};
use coedit_server::{CollabServer, ServerConfig};
use coedit_store::{DocumentStore, SqliteStore};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Long enough for several broadcast ticks to pass.
const TICK_SETTLE: Duration = Duration::from_millis(300);

fn start_server() -> CollabServer {
    let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let config = ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        tick_interval_ms: 50,
        ..ServerConfig::default()
    };
    CollabServer::start(&config, store).unwrap()
}

fn reply(client: &Client, request: &ClientRequest) -> ServerMessage {
    client.send(request).unwrap();
    client
        .message_timeout(REPLY_TIMEOUT)
        .expect("no reply within timeout")
}

fn auth(client: &Client, name: &str) {
    let msg = reply(
        client,
        &ClientRequest::SignUp(SignUpRequest {
            username: name.to_string(),
            password: "pw".to_string(),
        }),
    );
    assert!(matches!(msg, ServerMessage::SignUpResult(r) if r.ok));
    let msg = reply(
        client,
        &ClientRequest::LogIn(LogInRequest {
            username: name.to_string(),
            password: "pw".to_string(),
        }),
    );
    assert!(matches!(msg, ServerMessage::LogInResult(r) if r.ok));
}

fn create_doc(client: &Client, name: &str) -> i64 {
    match reply(
        client,
        &ClientRequest::CreateDocument(CreateDocumentRequest {
            name: name.to_string(),
        }),
    ) {
        ServerMessage::DocumentCreated(r) => r.document.expect("no document in reply").id,
        other => panic!("unexpected reply: {other:?}"),
    }
}

fn open_doc(client: &Client, doc: i64) -> EditorBuffer {
    match reply(client, &ClientRequest::OpenDocument(OpenDocumentRequest { doc })) {
        ServerMessage::ContentSnapshot(snapshot) => {
            assert_eq!(snapshot.doc, doc);
            EditorBuffer::new(doc, snapshot.content)
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

fn grant(owner: &Client, doc: i64, username: &str, can_read: bool, can_write: bool) {
    let msg = reply(
        owner,
        &ClientRequest::SetAccess(SetAccessRequest {
            doc,
            username: username.to_string(),
            can_read,
            can_write,
        }),
    );
    assert!(matches!(msg, ServerMessage::AccessUpdated(r) if r.ok));
}

fn send_edit(client: &Client, buffer: &mut EditorBuffer, new_text: &str) {
    let ops = buffer.edit(new_text);
    assert!(!ops.is_empty());
    client
        .send(&ClientRequest::UpdateContent(UpdateContentRequest {
            doc: buffer.doc(),
            ops,
        }))
        .unwrap();
}

#[test]
fn edits_flow_between_sessions() {
    let server = start_server();
    let owner = Client::connect(&server.local_addr().to_string()).unwrap();
    let guest = Client::connect(&server.local_addr().to_string()).unwrap();
    auth(&owner, "owner");
    auth(&guest, "guest");

    let doc = create_doc(&owner, "shared");
    let mut owner_buf = open_doc(&owner, doc);
    grant(&owner, doc, "guest", true, false);
    let mut guest_buf = open_doc(&guest, doc);
    assert_eq!(guest_buf.content(), "");

    // Owner edits; the batch reaches the guest on the next tick.
    send_edit(&owner, &mut owner_buf, "hello world");
    match guest.message_timeout(REPLY_TIMEOUT) {
        Some(ServerMessage::ContentUpdate(update)) => {
            assert_eq!(update.doc, doc);
            guest_buf.merge_remote(&update.ops);
        }
        other => panic!("unexpected message: {other:?}"),
    }
    assert_eq!(guest_buf.content(), "hello world");

    // The sender never gets its own batch back.
    thread::sleep(TICK_SETTLE);
    assert!(owner.try_message().is_none());

    // Read-only guest gets a rejection, not a broadcast.
    let rejected_ops = guest_buf.edit("hello brave world");
    guest
        .send(&ClientRequest::UpdateContent(UpdateContentRequest {
            doc,
            ops: rejected_ops.clone(),
        }))
        .unwrap();
    match guest.message_timeout(REPLY_TIMEOUT) {
        Some(ServerMessage::UpdateRejected(r)) => assert_eq!(r.doc, doc),
        other => panic!("unexpected message: {other:?}"),
    }
    thread::sleep(TICK_SETTLE);
    assert!(owner.try_message().is_none());

    // With write access the identical batch goes through and reaches the
    // owner.
    grant(&owner, doc, "guest", true, true);
    guest
        .send(&ClientRequest::UpdateContent(UpdateContentRequest {
            doc,
            ops: rejected_ops,
        }))
        .unwrap();
    match owner.message_timeout(REPLY_TIMEOUT) {
        Some(ServerMessage::ContentUpdate(update)) => owner_buf.merge_remote(&update.ops),
        other => panic!("unexpected message: {other:?}"),
    }
    assert_eq!(owner_buf.content(), "hello brave world");
    assert_eq!(owner_buf.content(), guest_buf.content());
}

#[test]
fn snapshot_reflects_earlier_edits() {
    let server = start_server();
    let owner = Client::connect(&server.local_addr().to_string()).unwrap();
    auth(&owner, "owner");

    let doc = create_doc(&owner, "notes");
    let mut buf = open_doc(&owner, doc);
    send_edit(&owner, &mut buf, "first line");
    thread::sleep(TICK_SETTLE);

    // A fresh session sees the merged content, not the empty original.
    let late = Client::connect(&server.local_addr().to_string()).unwrap();
    auth(&late, "late");
    grant(&owner, doc, "late", true, false);
    let late_buf = open_doc(&late, doc);
    assert_eq!(late_buf.content(), "first line");
}

#[test]
fn logout_stops_broadcasts_but_keeps_the_connection() {
    let server = start_server();
    let owner = Client::connect(&server.local_addr().to_string()).unwrap();
    let guest = Client::connect(&server.local_addr().to_string()).unwrap();
    auth(&owner, "owner");
    auth(&guest, "guest");

    let doc = create_doc(&owner, "shared");
    let _owner_buf = open_doc(&owner, doc);
    grant(&owner, doc, "guest", true, true);
    let mut guest_buf = open_doc(&guest, doc);

    let msg = reply(&owner, &ClientRequest::LogOut);
    assert!(matches!(msg, ServerMessage::LogOutResult(r) if r.ok));

    // The logged-out session no longer receives broadcasts.
    send_edit(&guest, &mut guest_buf, "after logout");
    thread::sleep(TICK_SETTLE);
    assert!(owner.try_message().is_none());

    // Requests on the same socket need a fresh log-in.
    let msg = reply(&owner, &ClientRequest::ListDocuments);
    assert!(matches!(msg, ServerMessage::Error(e) if e.code == "auth_required"));
    let msg = reply(
        &owner,
        &ClientRequest::LogIn(LogInRequest {
            username: "owner".to_string(),
            password: "pw".to_string(),
        }),
    );
    assert!(matches!(msg, ServerMessage::LogInResult(r) if r.ok));
}

#[test]
fn rename_and_delete_notify_other_sessions() {
    let server = start_server();
    let owner = Client::connect(&server.local_addr().to_string()).unwrap();
    let guest = Client::connect(&server.local_addr().to_string()).unwrap();
    auth(&owner, "owner");
    auth(&guest, "guest");

    let doc = create_doc(&owner, "draft");
    let _owner_buf = open_doc(&owner, doc);
    grant(&owner, doc, "guest", true, false);
    let _guest_buf = open_doc(&guest, doc);

    let msg = reply(
        &owner,
        &ClientRequest::RenameDocument(RenameDocumentRequest {
            doc,
            new_name: "final".to_string(),
        }),
    );
    assert!(matches!(msg, ServerMessage::DocumentRenamed(r) if r.ok && r.name == "final"));
    match guest.message_timeout(REPLY_TIMEOUT) {
        Some(ServerMessage::DocumentRenamed(r)) => assert_eq!(r.name, "final"),
        other => panic!("unexpected message: {other:?}"),
    }

    let msg = reply(
        &owner,
        &ClientRequest::DeleteDocument(DeleteDocumentRequest { doc }),
    );
    assert!(matches!(msg, ServerMessage::DocumentDeleted(r) if r.ok));
    match guest.message_timeout(REPLY_TIMEOUT) {
        Some(ServerMessage::DocumentDeleted(r)) => assert_eq!(r.doc, doc),
        other => panic!("unexpected message: {other:?}"),
    }

    // The document is gone for everyone.
    let msg = reply(&owner, &ClientRequest::OpenDocument(OpenDocumentRequest { doc }));
    assert!(matches!(msg, ServerMessage::Error(e) if e.code == "not_found"));
}
