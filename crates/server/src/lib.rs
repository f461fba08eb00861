//! CoEdit collaboration server.
//!
//! Thread-per-connection over plain TCP or TLS, with a timed scheduler that
//! fans accumulated edit batches out to the other open sessions on each
//! document. All mutable server state lives in small mutex-guarded
//! registries shared between the connection threads and the scheduler.

use std::fmt;
use std::io;

mod config;
mod registry;
mod scheduler;
mod server;
mod tls;

pub use config::{ServerConfig, TlsConfig};
pub use registry::{
    ConnId, DeliveryRegistry, OpHistory, PendingQueue, SessionEntry, SessionRegistry,
};
pub use scheduler::BroadcastScheduler;
pub use server::CollabServer;

#[derive(Debug)]
pub enum ServerError {
    /// Socket setup or accept-loop failure.
    Io(String),
    /// Certificate or key loading / TLS configuration failure.
    Tls(String),
    /// Config file read or parse failure.
    Config(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "IO error: {msg}"),
            Self::Tls(msg) => write!(f, "TLS error: {msg}"),
            Self::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
