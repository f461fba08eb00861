// Timed batch-broadcast scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use coedit_protocol::{ContentUpdate, ServerMessage};
use coedit_store::{AccessGate, GateOutcome};

use crate::registry::{DeliveryRegistry, PendingQueue, SessionRegistry};

/// Periodically drains the pending queue and fans each sender's batch out
/// to the other open sessions on the document.
///
/// Read permission is re-checked per recipient at broadcast time, so a
/// revoked grant stops deliveries at the next tick even while the session
/// entry still exists.
pub struct BroadcastScheduler {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BroadcastScheduler {
    pub fn start(
        interval: Duration,
        sessions: SessionRegistry,
        pending: PendingQueue,
        delivery: DeliveryRegistry,
        gate: AccessGate,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                thread::sleep(interval);
                tick(&sessions, &pending, &delivery, &gate);
            }
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BroadcastScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One broadcast pass over everything accumulated since the last tick.
fn tick(
    sessions: &SessionRegistry,
    pending: &PendingQueue,
    delivery: &DeliveryRegistry,
    gate: &AccessGate,
) {
    // Single atomic drain; batches enqueued from here on wait for the next
    // tick.
    let drained = pending.drain_all();
    for (doc, batches) in drained {
        let entries = sessions.sessions_for(doc);
        if entries.is_empty() {
            continue;
        }
        for (sender, ops) in batches {
            if ops.is_empty() {
                continue;
            }
            for entry in &entries {
                if entry.conn == sender {
                    continue;
                }
                match gate.can_read(doc, entry.user.id) {
                    Ok(GateOutcome::Granted(())) => {}
                    Ok(_) => continue,
                    Err(e) => {
                        log::error!("broadcast permission check failed for doc {doc}: {e}");
                        continue;
                    }
                }
                delivery.deliver(
                    entry.conn,
                    ServerMessage::ContentUpdate(ContentUpdate {
                        doc,
                        ops: ops.clone(),
                    }),
                );
            }
        }
    }
}
