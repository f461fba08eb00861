// Server configuration, loadable from a TOML file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::ServerError;

/// TLS material. When absent the server speaks plain TCP (local use,
/// tests).
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub db_path: PathBuf,
    /// Broadcast tick interval in milliseconds.
    pub tick_interval_ms: u64,
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8443".to_string(),
            db_path: PathBuf::from("coedit.db"),
            tick_interval_ms: 300,
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))
    }
}
