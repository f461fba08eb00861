// TLS setup and the plain-or-TLS stream wrapper.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use rustls::{ServerConfig as RustlsServerConfig, ServerConnection, StreamOwned};

use crate::config::TlsConfig;
use crate::ServerError;

/// Build the rustls server config from PEM files on disk.
pub fn server_tls_config(tls: &TlsConfig) -> Result<Arc<RustlsServerConfig>, ServerError> {
    let mut cert_reader = BufReader::new(
        File::open(&tls.cert)
            .map_err(|e| ServerError::Tls(format!("{}: {e}", tls.cert.display())))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("{}: {e}", tls.cert.display())))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "{}: no certificates found",
            tls.cert.display()
        )));
    }

    let mut key_reader = BufReader::new(
        File::open(&tls.key)
            .map_err(|e| ServerError::Tls(format!("{}: {e}", tls.key.display())))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ServerError::Tls(format!("{}: {e}", tls.key.display())))?
        .ok_or_else(|| ServerError::Tls(format!("{}: no private key found", tls.key.display())))?;

    let config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// A client connection, encrypted or not. The frame codec only needs
/// `Read + Write`, so the rest of the server never branches on this.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Stream {
    /// Wrap an accepted socket, starting a TLS session when configured.
    /// Read/write timeouts must already be set on the socket; the handshake
    /// itself completes lazily during the first reads.
    pub fn accept(
        stream: TcpStream,
        tls: Option<&Arc<RustlsServerConfig>>,
    ) -> Result<Self, ServerError> {
        match tls {
            None => Ok(Self::Plain(stream)),
            Some(config) => {
                let conn = ServerConnection::new(Arc::clone(config))
                    .map_err(|e| ServerError::Tls(e.to_string()))?;
                Ok(Self::Tls(Box::new(StreamOwned::new(conn, stream))))
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn missing_cert_file_is_a_tls_error() {
        let tls = TlsConfig {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };
        match server_tls_config(&tls) {
            Err(ServerError::Tls(msg)) => assert!(msg.contains("cert.pem"), "{msg}"),
            other => panic!("expected Tls error, got {other:?}"),
        }
    }

    #[test]
    fn empty_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        File::create(&cert).unwrap().write_all(b"").unwrap();
        File::create(&key).unwrap().write_all(b"").unwrap();

        let tls = TlsConfig {
            cert: cert.clone(),
            key,
        };
        match server_tls_config(&tls) {
            Err(ServerError::Tls(msg)) => {
                assert!(msg.contains("no certificates"), "{msg}")
            }
            other => panic!("expected Tls error, got {other:?}"),
        }
    }
}
