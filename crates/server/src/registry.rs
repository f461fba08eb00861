// Shared server state: delivery channels, open sessions, pending batches,
// and per-document replicas.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use coedit_engine::{Operation, Replica};
use coedit_protocol::ServerMessage;
use coedit_store::{DocId, DocumentStore, StoreError, User};

/// Bounded queue depth per connection for outbound deliveries.
/// If a connection's queue is full, new deliveries are dropped for it.
pub const DELIVERY_QUEUE_DEPTH: usize = 256;

/// Identifies one live connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// Delivery registry
// ============================================================================

/// Per-connection outbound channels. Connection threads own the receiving
/// end and interleave deliveries with their read loop; everyone else pushes
/// through `deliver`, which never blocks.
#[derive(Clone)]
pub struct DeliveryRegistry {
    senders: Arc<Mutex<Vec<(ConnId, mpsc::SyncSender<ServerMessage>)>>>,
    next_id: Arc<AtomicU64>,
    /// Total deliveries dropped due to backpressure.
    dropped: Arc<AtomicU64>,
}

impl DeliveryRegistry {
    pub fn new() -> Self {
        Self {
            senders: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a new connection and hand back its outbox.
    pub fn register(&self) -> (ConnId, mpsc::Receiver<ServerMessage>) {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::sync_channel(DELIVERY_QUEUE_DEPTH);
        self.senders.lock().unwrap().push((id, tx));
        (id, rx)
    }

    pub fn unregister(&self, conn: ConnId) {
        self.senders.lock().unwrap().retain(|(id, _)| *id != conn);
    }

    /// Queue a message for one connection. Returns false if the connection
    /// is gone or its queue is full (the message is dropped, not queued).
    pub fn deliver(&self, conn: ConnId, msg: ServerMessage) -> bool {
        let senders = self.senders.lock().unwrap();
        let Some((_, tx)) = senders.iter().find(|(id, _)| *id == conn) else {
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("delivery dropped for {conn} (backpressure)");
                false
            }
            Err(mpsc::TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for DeliveryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Session registry
// ============================================================================

/// One open-document session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub user: User,
    pub conn: ConnId,
}

/// Which (user, connection) pairs currently have each document open.
/// At most one entry per (user, document), whatever the open/reopen history.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<DocId, Vec<SessionEntry>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, doc: DocId, user: User, conn: ConnId) {
        let mut map = self.inner.lock().unwrap();
        let entries = map.entry(doc).or_default();
        entries.retain(|e| e.user.id != user.id);
        entries.push(SessionEntry { user, conn });
    }

    pub fn close(&self, doc: DocId, conn: ConnId) {
        let mut map = self.inner.lock().unwrap();
        if let Some(entries) = map.get_mut(&doc) {
            entries.retain(|e| e.conn != conn);
            if entries.is_empty() {
                map.remove(&doc);
            }
        }
    }

    /// Drop every session held by a closing connection.
    pub fn purge_conn(&self, conn: ConnId) {
        let mut map = self.inner.lock().unwrap();
        for entries in map.values_mut() {
            entries.retain(|e| e.conn != conn);
        }
        map.retain(|_, entries| !entries.is_empty());
    }

    /// Remove all sessions for a document, returning them (for eviction
    /// notices).
    pub fn evict_doc(&self, doc: DocId) -> Vec<SessionEntry> {
        self.inner.lock().unwrap().remove(&doc).unwrap_or_default()
    }

    pub fn sessions_for(&self, doc: DocId) -> Vec<SessionEntry> {
        self.inner
            .lock()
            .unwrap()
            .get(&doc)
            .cloned()
            .unwrap_or_default()
    }
}

// ============================================================================
// Pending broadcast queue
// ============================================================================

/// Edit batches accumulated between scheduler ticks, keyed by document and
/// sending connection so a sender never receives its own batch back.
#[derive(Clone, Default)]
pub struct PendingQueue {
    inner: Arc<Mutex<HashMap<DocId, HashMap<ConnId, Vec<Operation>>>>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, doc: DocId, sender: ConnId, ops: Vec<Operation>) {
        let mut map = self.inner.lock().unwrap();
        map.entry(doc)
            .or_default()
            .entry(sender)
            .or_default()
            .extend(ops);
    }

    /// Take everything accumulated so far in one atomic swap. Batches
    /// enqueued after this call land in the next tick.
    pub fn drain_all(&self) -> HashMap<DocId, HashMap<ConnId, Vec<Operation>>> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn remove(&self, doc: DocId, sender: ConnId) {
        let mut map = self.inner.lock().unwrap();
        if let Some(senders) = map.get_mut(&doc) {
            senders.remove(&sender);
            if senders.is_empty() {
                map.remove(&doc);
            }
        }
    }

    pub fn purge_conn(&self, conn: ConnId) {
        let mut map = self.inner.lock().unwrap();
        for senders in map.values_mut() {
            senders.remove(&conn);
        }
        map.retain(|_, senders| !senders.is_empty());
    }

    pub fn evict_doc(&self, doc: DocId) {
        self.inner.lock().unwrap().remove(&doc);
    }
}

// ============================================================================
// Authoritative replicas
// ============================================================================

/// The server-side replica per document: current content plus applied
/// history, loaded lazily from the store and written back after each batch.
#[derive(Clone, Default)]
pub struct OpHistory {
    inner: Arc<Mutex<HashMap<DocId, Replica>>>,
}

impl OpHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch into the authoritative replica and persist the result.
    /// Load, merge, and save happen under one lock so concurrent writers to
    /// the same document serialize here.
    pub fn apply_batch(
        &self,
        store: &dyn DocumentStore,
        doc: DocId,
        ops: &[Operation],
    ) -> Result<(), StoreError> {
        let mut map = self.inner.lock().unwrap();
        let replica = match map.entry(doc) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let content = store
                    .get_content(doc)?
                    .ok_or_else(|| StoreError::Conflict(format!("no document with id {doc}")))?;
                entry.insert(Replica::new(content))
            }
        };
        replica.merge(ops);
        store.save_content(doc, replica.content())
    }

    pub fn evict(&self, doc: DocId) {
        self.inner.lock().unwrap().remove(&doc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coedit_protocol::{ContentSnapshot, ServerMessage};
    use coedit_store::SqliteStore;

    fn user(id: i64, name: &str) -> User {
        User {
            id,
            username: name.to_string(),
        }
    }

    fn probe(doc: i64) -> ServerMessage {
        ServerMessage::ContentSnapshot(ContentSnapshot {
            doc,
            content: String::new(),
        })
    }

    #[test]
    fn delivery_round_trip() {
        let registry = DeliveryRegistry::new();
        let (conn, rx) = registry.register();
        assert_eq!(registry.connection_count(), 1);

        assert!(registry.deliver(conn, probe(1)));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::ContentSnapshot(_)
        ));

        registry.unregister(conn);
        assert_eq!(registry.connection_count(), 0);
        assert!(!registry.deliver(conn, probe(1)));
    }

    #[test]
    fn delivery_drops_on_backpressure() {
        let registry = DeliveryRegistry::new();
        let (conn, _rx) = registry.register();
        for i in 0..(DELIVERY_QUEUE_DEPTH + 10) {
            registry.deliver(conn, probe(i as i64));
        }
        assert_eq!(registry.dropped_count(), 10);
    }

    #[test]
    fn reopening_keeps_one_session_per_user() {
        let sessions = SessionRegistry::new();
        let ada = user(1, "ada");
        sessions.open(7, ada.clone(), ConnId(1));
        sessions.open(7, ada.clone(), ConnId(2));
        let entries = sessions.sessions_for(7);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].conn, ConnId(2));
    }

    #[test]
    fn purge_conn_removes_all_sessions() {
        let sessions = SessionRegistry::new();
        sessions.open(1, user(1, "ada"), ConnId(9));
        sessions.open(2, user(1, "ada"), ConnId(9));
        sessions.open(2, user(2, "bob"), ConnId(3));
        sessions.purge_conn(ConnId(9));
        assert!(sessions.sessions_for(1).is_empty());
        assert_eq!(sessions.sessions_for(2).len(), 1);
    }

    #[test]
    fn pending_queue_drains_atomically() {
        let pending = PendingQueue::new();
        pending.enqueue(1, ConnId(1), vec![Operation::insert("a", 0, 0)]);
        pending.enqueue(1, ConnId(1), vec![Operation::insert("b", 0, 1)]);
        pending.enqueue(1, ConnId(2), vec![Operation::insert("c", 0, 0)]);

        let drained = pending.drain_all();
        assert_eq!(drained[&1][&ConnId(1)].len(), 2);
        assert_eq!(drained[&1][&ConnId(2)].len(), 1);
        assert!(pending.drain_all().is_empty());
    }

    #[test]
    fn pending_queue_purges_by_connection() {
        let pending = PendingQueue::new();
        pending.enqueue(1, ConnId(1), vec![Operation::insert("a", 0, 0)]);
        pending.enqueue(1, ConnId(2), vec![Operation::insert("b", 0, 0)]);
        pending.purge_conn(ConnId(1));
        let drained = pending.drain_all();
        assert!(!drained[&1].contains_key(&ConnId(1)));
        assert!(drained[&1].contains_key(&ConnId(2)));
    }

    #[test]
    fn apply_batch_persists_merged_content() {
        let store = SqliteStore::open_in_memory().unwrap();
        let owner = store.add_user("ada", "pw").unwrap();
        let doc = store.create_document("notes", owner.id).unwrap();
        store.save_content(doc.id, "ab").unwrap();

        let histories = OpHistory::new();
        histories
            .apply_batch(&store, doc.id, &[Operation::insert("c", 0, 1)])
            .unwrap();
        assert_eq!(store.get_content(doc.id).unwrap().as_deref(), Some("acb"));

        // Unknown document is an error, not a panic.
        assert!(histories
            .apply_batch(&store, 999, &[Operation::insert("x", 0, 0)])
            .is_err());
    }
}
