//! CoEdit client library.
//!
//! A [`Client`] owns one connection to the collaboration server, plain TCP
//! or TLS. A background thread reads frames off the socket and queues the
//! decoded [`ServerMessage`]s, so broadcasts pushed between replies are
//! never lost; callers drain the queue with [`Client::try_message`] or
//! [`Client::message_timeout`].
//!
//! [`EditorBuffer`] is the document-side half: it turns whole-text edits
//! into operation batches and merges broadcast batches back in.

mod buffer;

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use coedit_protocol::framing;
use coedit_protocol::{ClientRequest, FrameError, FrameReader, ServerMessage};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

pub use buffer::EditorBuffer;

/// How long a read blocks before the listener thread re-checks shutdown.
/// Also bounds how long [`Client::send`] can wait for the stream lock.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum ClientError {
    /// Connect, read, or write failure.
    Io(String),
    /// Certificate loading or TLS session setup failure.
    Tls(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "IO error: {msg}"),
            Self::Tls(msg) => write!(f, "TLS error: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// The server connection, encrypted or not.
enum ClientStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// One connection to the collaboration server.
pub struct Client {
    stream: Arc<Mutex<FrameReader<ClientStream>>>,
    messages: mpsc::Receiver<ServerMessage>,
    running: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Connect over plain TCP.
    pub fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        configure_socket(&stream)?;
        Ok(Self::start(ClientStream::Plain(stream)))
    }

    /// Connect over TLS, trusting the CA certificates in `ca_cert` (PEM).
    /// `server_name` is the name the server's certificate must match.
    pub fn connect_tls(addr: &str, server_name: &str, ca_cert: &Path) -> Result<Self, ClientError> {
        let mut roots = RootCertStore::empty();
        let mut reader = BufReader::new(
            File::open(ca_cert)
                .map_err(|e| ClientError::Tls(format!("{}: {e}", ca_cert.display())))?,
        );
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| ClientError::Tls(format!("{}: {e}", ca_cert.display())))?;
            roots
                .add(cert)
                .map_err(|e| ClientError::Tls(e.to_string()))?;
            added += 1;
        }
        if added == 0 {
            return Err(ClientError::Tls(format!(
                "{}: no certificates found",
                ca_cert.display()
            )));
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::Tls(format!("invalid server name {server_name}: {e}")))?;
        let conn = ClientConnection::new(Arc::new(config), name)
            .map_err(|e| ClientError::Tls(e.to_string()))?;

        let stream = TcpStream::connect(addr)?;
        configure_socket(&stream)?;
        Ok(Self::start(ClientStream::Tls(Box::new(StreamOwned::new(
            conn, stream,
        )))))
    }

    fn start(stream: ClientStream) -> Self {
        let stream = Arc::new(Mutex::new(FrameReader::new(stream)));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();

        let listener = {
            let stream = Arc::clone(&stream);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    // The lock is held for at most one poll interval, which
                    // is what bounds send() latency.
                    let polled = stream.lock().unwrap().poll_frame();
                    match polled {
                        Ok(None) => continue,
                        Ok(Some(frame)) => match framing::decode::<ServerMessage>(&frame) {
                            Ok(msg) => {
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("undecodable server message: {e}"),
                        },
                        Err(FrameError::Closed) => {
                            log::debug!("server closed the connection");
                            running.store(false, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => {
                            log::warn!("connection error: {e}");
                            running.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            })
        };

        Self {
            stream,
            messages: rx,
            running,
            listener: Some(listener),
        }
    }

    pub fn send(&self, request: &ClientRequest) -> Result<(), ClientError> {
        let mut guard = self.stream.lock().unwrap();
        framing::send_message(guard.get_mut(), request)
            .map_err(|e| ClientError::Io(e.to_string()))
    }

    /// Next queued message, if any.
    pub fn try_message(&self) -> Option<ServerMessage> {
        self.messages.try_recv().ok()
    }

    /// Next message, waiting up to `timeout` for one to arrive.
    pub fn message_timeout(&self, timeout: Duration) -> Option<ServerMessage> {
        self.messages.recv_timeout(timeout).ok()
    }

    /// False once the server has closed the connection or the transport
    /// failed.
    pub fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn disconnect(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_read_timeout(Some(POLL_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    Ok(())
}
