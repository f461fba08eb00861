// Listener, connection handling, and request dispatch.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use coedit_protocol::framing;
use coedit_protocol::{
    AccessInfo, AccessUpdated, ClientRequest, ContentSnapshot, CreateDocumentRequest,
    DeleteDocumentRequest, DocumentCreated, DocumentDeleted, DocumentInfo, DocumentList,
    DocumentRenamed, ErrorMessage, FrameError, FrameReader, LogInRequest, LogInResult,
    LogOutResult, OpenDocumentRequest, QueryAccessRequest, RenameDocumentRequest,
    ResolveUserRequest, ServerMessage, SetAccessRequest, SignUpRequest, SignUpResult,
    UpdateContentRequest, UpdateRejected, UserInfo, UserResolved,
};
use coedit_store::{
    Access, AccessGate, Document, DocumentStore, GateOutcome, Grant, StoreError, User,
};

use crate::config::ServerConfig;
use crate::registry::{ConnId, DeliveryRegistry, OpHistory, PendingQueue, SessionRegistry};
use crate::scheduler::BroadcastScheduler;
use crate::tls::{server_tls_config, Stream};
use crate::ServerError;

/// Hard cap on simultaneous connections; accepts beyond it are refused.
const MAX_CONNECTIONS: usize = 128;

/// Consecutive undecodable requests before the connection is dropped.
const MAX_PARSE_FAILURES: u32 = 3;

/// How long the accept loop sleeps when no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Per-connection read timeout; sets the cadence at which the connection
/// thread flushes queued deliveries between reads.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection thread and the scheduler share.
#[derive(Clone)]
struct Shared {
    store: Arc<dyn DocumentStore>,
    gate: AccessGate,
    sessions: SessionRegistry,
    pending: PendingQueue,
    delivery: DeliveryRegistry,
    histories: OpHistory,
    tls: Option<Arc<rustls::ServerConfig>>,
}

/// The collaboration server: accept loop, connection threads, and the
/// broadcast scheduler, torn down together on drop.
pub struct CollabServer {
    shutdown: Arc<AtomicBool>,
    listener_handle: Option<JoinHandle<()>>,
    scheduler: Option<BroadcastScheduler>,
    delivery: DeliveryRegistry,
    local_addr: SocketAddr,
}

impl CollabServer {
    pub fn start(config: &ServerConfig, store: Arc<dyn DocumentStore>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.listen)?;
        let local_addr = listener.local_addr()?;
        // Non-blocking accept so the loop can observe the shutdown flag.
        listener.set_nonblocking(true)?;

        let tls = config.tls.as_ref().map(server_tls_config).transpose()?;
        let shared = Shared {
            gate: AccessGate::new(Arc::clone(&store)),
            store,
            sessions: SessionRegistry::new(),
            pending: PendingQueue::new(),
            delivery: DeliveryRegistry::new(),
            histories: OpHistory::new(),
            tls,
        };

        let scheduler = BroadcastScheduler::start(
            Duration::from_millis(config.tick_interval_ms),
            shared.sessions.clone(),
            shared.pending.clone(),
            shared.delivery.clone(),
            shared.gate.clone(),
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let listener_handle = {
            let shutdown = Arc::clone(&shutdown);
            let shared = shared.clone();
            thread::spawn(move || run_listener(listener, shutdown, shared))
        };

        log::info!(
            "listening on {local_addr} ({})",
            if shared.tls.is_some() { "tls" } else { "plain" }
        );
        Ok(Self {
            shutdown,
            listener_handle: Some(listener_handle),
            scheduler: Some(scheduler),
            delivery: shared.delivery,
            local_addr,
        })
    }

    /// The bound address; useful when the config asked for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.delivery.connection_count()
    }

    pub fn dropped_delivery_count(&self) -> u64 {
        self.delivery.dropped_count()
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listener_handle.take() {
            let _ = handle.join();
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
    }
}

impl Drop for CollabServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accept loop; one thread per accepted connection.
fn run_listener(listener: TcpListener, shutdown: Arc<AtomicBool>, shared: Shared) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if shared.delivery.connection_count() >= MAX_CONNECTIONS {
                    log::warn!("connection refused from {addr}: limit of {MAX_CONNECTIONS} reached");
                    drop(stream);
                    continue;
                }
                log::debug!("accepted connection from {addr}");
                let shared = shared.clone();
                thread::spawn(move || {
                    let (conn, outbox) = shared.delivery.register();
                    let result = handle_connection(stream, conn, &outbox, &shared);
                    // Teardown order matters: sessions first so the next
                    // tick no longer targets this connection.
                    shared.sessions.purge_conn(conn);
                    shared.pending.purge_conn(conn);
                    shared.delivery.unregister(conn);
                    if let Err(e) = result {
                        log::warn!("connection error from {addr}: {e}");
                    }
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::error!("accept error: {e}");
                break;
            }
        }
    }
}

fn frame_to_io(e: FrameError) -> io::Error {
    match e {
        FrameError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

/// Serve one connection until it closes or misbehaves.
fn handle_connection(
    stream: TcpStream,
    conn: ConnId,
    outbox: &mpsc::Receiver<ServerMessage>,
    shared: &Shared,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let stream = Stream::accept(stream, shared.tls.as_ref())
        .map_err(|e| io::Error::other(e.to_string()))?;

    let mut reader = FrameReader::new(stream);
    let mut authed: Option<User> = None;
    let mut parse_failures: u32 = 0;

    loop {
        // Flush queued deliveries before reading more requests.
        while let Ok(msg) = outbox.try_recv() {
            if let Err(e) = framing::send_message(reader.get_mut(), &msg) {
                log::debug!("delivery send failed on {conn}: {e}");
                return Ok(());
            }
        }

        let frame = match reader.poll_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(FrameError::Closed) => return Ok(()),
            Err(FrameError::MalformedLength) => {
                let _ = framing::send_message(
                    reader.get_mut(),
                    &ServerMessage::Error(ErrorMessage::malformed()),
                );
                log::warn!("{conn} broke framing, disconnecting");
                return Ok(());
            }
            Err(FrameError::Oversize(len)) => {
                let _ = framing::send_message(
                    reader.get_mut(),
                    &ServerMessage::Error(ErrorMessage::malformed()),
                );
                log::warn!("{conn} sent an oversized frame ({len} bytes), disconnecting");
                return Ok(());
            }
            Err(FrameError::Decode(msg)) => {
                log::debug!("unexpected decode error on {conn}: {msg}");
                continue;
            }
            Err(FrameError::Io(e)) => return Err(e),
        };

        let request: ClientRequest = match framing::decode(&frame) {
            Ok(request) => {
                parse_failures = 0;
                request
            }
            Err(e) => {
                parse_failures += 1;
                log::debug!("malformed request on {conn} ({parse_failures}/{MAX_PARSE_FAILURES}): {e}");
                framing::send_message(
                    reader.get_mut(),
                    &ServerMessage::Error(ErrorMessage::malformed()),
                )
                .map_err(frame_to_io)?;
                if parse_failures >= MAX_PARSE_FAILURES {
                    log::warn!("{conn} exceeded parse failure limit, disconnecting");
                    return Ok(());
                }
                continue;
            }
        };

        if let Some(reply) = handle_request(request, &mut authed, conn, shared) {
            framing::send_message(reader.get_mut(), &reply).map_err(frame_to_io)?;
        }
    }
}

// ============================================================================
// Request dispatch
// ============================================================================

fn user_info(user: &User) -> UserInfo {
    UserInfo {
        id: user.id,
        username: user.username.clone(),
    }
}

fn document_info(document: &Document) -> DocumentInfo {
    DocumentInfo {
        id: document.id,
        name: document.name.clone(),
        owner: document.owner_name.clone(),
        created_at: document.created_at.clone(),
    }
}

fn store_failure(context: &str, e: StoreError) -> ServerMessage {
    log::error!("{context}: {e}");
    ServerMessage::Error(ErrorMessage::internal(e.to_string()))
}

/// Handle one request. `None` means the request sends no direct reply.
fn handle_request(
    request: ClientRequest,
    authed: &mut Option<User>,
    conn: ConnId,
    shared: &Shared,
) -> Option<ServerMessage> {
    match request {
        ClientRequest::SignUp(r) => Some(sign_up(shared, &r)),
        ClientRequest::LogIn(r) => Some(log_in(shared, authed, conn, &r)),
        request => {
            let Some(user) = authed.clone() else {
                return Some(ServerMessage::Error(ErrorMessage::auth_required()));
            };
            handle_authed(request, &user, authed, conn, shared)
        }
    }
}

fn handle_authed(
    request: ClientRequest,
    user: &User,
    authed: &mut Option<User>,
    conn: ConnId,
    shared: &Shared,
) -> Option<ServerMessage> {
    match request {
        // Handled before the auth check.
        ClientRequest::SignUp(_) | ClientRequest::LogIn(_) => None,

        ClientRequest::LogOut => {
            // Soft teardown: sessions and pending batches go, the socket
            // stays for a later log-in.
            shared.sessions.purge_conn(conn);
            shared.pending.purge_conn(conn);
            *authed = None;
            log::info!("{} logged out on {conn}", user.username);
            Some(ServerMessage::LogOutResult(LogOutResult { ok: true }))
        }
        ClientRequest::ListDocuments => Some(list_documents(shared, user)),
        ClientRequest::CreateDocument(r) => Some(create_document(shared, user, &r)),
        ClientRequest::RenameDocument(r) => Some(rename_document(shared, user, conn, &r)),
        ClientRequest::DeleteDocument(r) => Some(delete_document(shared, user, conn, &r)),
        ClientRequest::OpenDocument(r) => Some(open_document(shared, user, conn, &r)),
        ClientRequest::CloseDocument(r) => {
            shared.sessions.close(r.doc, conn);
            shared.pending.remove(r.doc, conn);
            None
        }
        ClientRequest::UpdateContent(r) => update_content(shared, user, conn, r),
        ClientRequest::QueryAccess(r) => Some(query_access(shared, user, &r)),
        ClientRequest::SetAccess(r) => Some(set_access(shared, user, &r)),
        ClientRequest::ResolveUser(r) => Some(resolve_user(shared, &r)),
    }
}

fn sign_up(shared: &Shared, r: &SignUpRequest) -> ServerMessage {
    match shared.store.add_user(&r.username, &r.password) {
        Ok(user) => ServerMessage::SignUpResult(SignUpResult {
            ok: true,
            message: format!("account created for {}", user.username),
        }),
        Err(StoreError::Conflict(_)) => ServerMessage::SignUpResult(SignUpResult {
            ok: false,
            message: "username already taken".to_string(),
        }),
        Err(e) => store_failure("sign-up", e),
    }
}

fn log_in(
    shared: &Shared,
    authed: &mut Option<User>,
    conn: ConnId,
    r: &LogInRequest,
) -> ServerMessage {
    match shared.store.verify_credentials(&r.username, &r.password) {
        Ok(Some(user)) => {
            log::info!("{} logged in on {conn}", user.username);
            let info = user_info(&user);
            *authed = Some(user);
            ServerMessage::LogInResult(LogInResult {
                ok: true,
                user: Some(info),
            })
        }
        Ok(None) => ServerMessage::LogInResult(LogInResult {
            ok: false,
            user: None,
        }),
        Err(e) => store_failure("log-in", e),
    }
}

fn list_documents(shared: &Shared, user: &User) -> ServerMessage {
    match shared.store.list_documents(user.id) {
        Ok(documents) => ServerMessage::DocumentList(DocumentList {
            documents: documents.iter().map(document_info).collect(),
        }),
        Err(e) => store_failure("list documents", e),
    }
}

fn create_document(shared: &Shared, user: &User, r: &CreateDocumentRequest) -> ServerMessage {
    match shared.store.create_document(&r.name, user.id) {
        Ok(document) => ServerMessage::DocumentCreated(DocumentCreated {
            ok: true,
            document: Some(document_info(&document)),
        }),
        Err(e) => store_failure("create document", e),
    }
}

/// Owner check shared by the owner-only operations.
fn require_owner(shared: &Shared, doc: i64, user: &User) -> Result<(), ServerMessage> {
    match shared.gate.is_owner(doc, user.id) {
        Ok(GateOutcome::Granted(())) => Ok(()),
        Ok(GateOutcome::Denied) => Err(ServerMessage::Error(ErrorMessage::access_denied())),
        Ok(GateOutcome::Missing) => Err(ServerMessage::Error(ErrorMessage::not_found())),
        Err(e) => Err(store_failure("owner check", e)),
    }
}

fn rename_document(
    shared: &Shared,
    user: &User,
    conn: ConnId,
    r: &RenameDocumentRequest,
) -> ServerMessage {
    if let Err(reply) = require_owner(shared, r.doc, user) {
        return reply;
    }
    if let Err(e) = shared.store.rename_document(r.doc, &r.new_name) {
        return store_failure("rename document", e);
    }
    let notice = ServerMessage::DocumentRenamed(DocumentRenamed {
        ok: true,
        doc: r.doc,
        name: r.new_name.clone(),
    });
    for entry in shared.sessions.sessions_for(r.doc) {
        if entry.conn != conn {
            shared.delivery.deliver(entry.conn, notice.clone());
        }
    }
    notice
}

fn delete_document(
    shared: &Shared,
    user: &User,
    conn: ConnId,
    r: &DeleteDocumentRequest,
) -> ServerMessage {
    if let Err(reply) = require_owner(shared, r.doc, user) {
        return reply;
    }
    if let Err(e) = shared.store.delete_document(r.doc) {
        return store_failure("delete document", e);
    }
    let evicted = shared.sessions.evict_doc(r.doc);
    shared.pending.evict_doc(r.doc);
    shared.histories.evict(r.doc);
    let notice = ServerMessage::DocumentDeleted(DocumentDeleted {
        ok: true,
        doc: r.doc,
    });
    for entry in evicted {
        if entry.conn != conn {
            shared.delivery.deliver(entry.conn, notice.clone());
        }
    }
    notice
}

fn open_document(
    shared: &Shared,
    user: &User,
    conn: ConnId,
    r: &OpenDocumentRequest,
) -> ServerMessage {
    match shared.gate.read_content(r.doc, user.id) {
        Ok(GateOutcome::Granted(content)) => {
            shared.sessions.open(r.doc, user.clone(), conn);
            log::debug!("{} opened doc {} on {conn}", user.username, r.doc);
            ServerMessage::ContentSnapshot(ContentSnapshot {
                doc: r.doc,
                content,
            })
        }
        Ok(GateOutcome::Denied) => ServerMessage::Error(ErrorMessage::access_denied()),
        Ok(GateOutcome::Missing) => ServerMessage::Error(ErrorMessage::not_found()),
        Err(e) => store_failure("open document", e),
    }
}

fn update_content(
    shared: &Shared,
    user: &User,
    conn: ConnId,
    r: UpdateContentRequest,
) -> Option<ServerMessage> {
    if r.ops.is_empty() {
        return None;
    }
    match shared.gate.can_write(r.doc, user.id) {
        Ok(GateOutcome::Granted(())) => {
            if let Err(e) = shared.histories.apply_batch(shared.store.as_ref(), r.doc, &r.ops) {
                return Some(store_failure("apply batch", e));
            }
            shared.pending.enqueue(r.doc, conn, r.ops);
            None
        }
        Ok(GateOutcome::Denied) => Some(ServerMessage::UpdateRejected(UpdateRejected {
            doc: r.doc,
            reason: "write access required".to_string(),
        })),
        Ok(GateOutcome::Missing) => Some(ServerMessage::Error(ErrorMessage::not_found())),
        Err(e) => Some(store_failure("write check", e)),
    }
}

fn query_access(shared: &Shared, user: &User, r: &QueryAccessRequest) -> ServerMessage {
    if let Err(reply) = require_owner(shared, r.doc, user) {
        return reply;
    }
    match shared.store.grants_for(r.doc) {
        Ok(grants) => ServerMessage::AccessInfo(AccessInfo {
            doc: r.doc,
            grants: grants
                .iter()
                .map(|g: &Grant| coedit_protocol::GrantInfo {
                    username: g.username.clone(),
                    can_read: g.access.can_read,
                    can_write: g.access.can_write,
                })
                .collect(),
        }),
        Err(e) => store_failure("query access", e),
    }
}

fn set_access(shared: &Shared, user: &User, r: &SetAccessRequest) -> ServerMessage {
    if let Err(reply) = require_owner(shared, r.doc, user) {
        return reply;
    }
    let target = match shared.store.resolve_user(&r.username) {
        Ok(Some(target)) => target,
        Ok(None) => return ServerMessage::Error(ErrorMessage::not_found()),
        Err(e) => return store_failure("resolve user", e),
    };
    if target.id == user.id {
        return ServerMessage::AccessUpdated(AccessUpdated {
            ok: false,
            message: "the owner's access is implicit".to_string(),
        });
    }
    let access = Access {
        can_read: r.can_read,
        can_write: r.can_write,
    };
    match shared.store.set_access(r.doc, target.id, access) {
        Ok(()) => ServerMessage::AccessUpdated(AccessUpdated {
            ok: true,
            message: format!("access updated for {}", r.username),
        }),
        Err(e) => store_failure("set access", e),
    }
}

fn resolve_user(shared: &Shared, r: &ResolveUserRequest) -> ServerMessage {
    match shared.store.resolve_user(&r.username) {
        Ok(found) => ServerMessage::UserResolved(UserResolved {
            username: r.username.clone(),
            user: found.as_ref().map(user_info),
        }),
        Err(e) => store_failure("resolve user", e),
    }
}
