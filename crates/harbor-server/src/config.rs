//! Server configuration.
//!
//! The server consumes a validated TOML document; the interactive tooling
//! that produces and encrypts it lives outside this crate. `validate()` runs
//! once at startup and every component reads the result immutably afterward.

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listener and connection tuning
    pub network: NetworkConfig,
    /// Certificates and revocation
    pub security: SecurityConfig,
    /// Exposed libraries
    #[serde(default, rename = "library")]
    pub libraries: Vec<LibraryConfig>,
    /// Known clients
    #[serde(default, rename = "client")]
    pub clients: Vec<ClientConfig>,
    /// Logging parameters
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and connection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Default session idle timeout in seconds (libraries may override)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Chunk size hint handed to clients at handshake
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Per-frame read timeout in seconds, detects half-open peers
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

/// Certificates and revocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// CA certificate clients are verified against (PEM)
    pub ca_certificate: PathBuf,
    /// Server certificate chain (PEM)
    pub certificate: PathBuf,
    /// Server private key (PEM)
    pub private_key: PathBuf,
    /// CA signing key; consumed by the issuance tooling, never read here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_private_key: Option<PathBuf>,
    /// Revoked certificate fingerprints (hex SHA-256)
    #[serde(default)]
    pub revoked_fingerprints: Vec<String>,
}

/// One exposed library
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Stable opaque id clients handshake with
    pub id: String,
    /// Human name
    pub name: String,
    /// Absolute root directory
    pub root: PathBuf,
    /// Client labels permitted to bind to this library
    #[serde(default)]
    pub authorized_clients: Vec<String>,
    /// Byte/second cap shared by the library's sessions; 0 = unbounded
    #[serde(default)]
    pub rate_limit: u64,
    /// Idle timeout override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    /// Serialize write workloads: one writing session at a time
    #[serde(default = "default_true")]
    pub serialize_writes: bool,
}

/// One known client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Label referenced by `authorized_clients`
    pub id: String,
    /// Display name
    pub name: String,
    /// Client certificate (PEM); its fingerprint is the canonical identity
    pub certificate: PathBuf,
    /// Reject this client everywhere
    #[serde(default)]
    pub revoked: bool,
}

/// Logging parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    256
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_chunk_size() -> u32 {
    1024 * 1024 // 1 MiB
}

fn default_read_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` for unreadable, unparsable, or invalid
    /// documents.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ServerError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the bind address.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` for an unparsable host.
    pub fn bind_addr(&self) -> Result<SocketAddr, ServerError> {
        format!("{}:{}", self.network.host, self.network.port)
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address: {e}")))
    }

    /// Default idle timeout.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.network.idle_timeout_secs)
    }

    /// Per-frame read timeout.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.network.read_timeout_secs)
    }

    /// Validate the document: parseable address, sane limits, unique ids,
    /// library roots that exist and are directories, authorization lists
    /// that reference declared clients.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` naming the first violation.
    pub fn validate(&self) -> Result<(), ServerError> {
        self.bind_addr()?;

        if self.network.chunk_size == 0 || self.network.chunk_size > harbor_proto::MAX_BODY_LEN {
            return Err(ServerError::Config(format!(
                "chunk_size must be between 1 and {}",
                harbor_proto::MAX_BODY_LEN
            )));
        }
        if self.network.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be nonzero".into()));
        }
        if self.network.idle_timeout_secs == 0 {
            return Err(ServerError::Config("idle_timeout_secs must be nonzero".into()));
        }
        if self.libraries.is_empty() {
            return Err(ServerError::Config("at least one library is required".into()));
        }

        let mut library_ids = HashSet::new();
        for library in &self.libraries {
            if library.id.is_empty() {
                return Err(ServerError::Config("library id must be nonempty".into()));
            }
            if !library_ids.insert(library.id.as_str()) {
                return Err(ServerError::Config(format!(
                    "duplicate library id: {}",
                    library.id
                )));
            }
            if !library.root.is_absolute() {
                return Err(ServerError::Config(format!(
                    "library {} root must be absolute: {}",
                    library.id,
                    library.root.display()
                )));
            }
            if !library.root.is_dir() {
                return Err(ServerError::Config(format!(
                    "library {} root is not a directory: {}",
                    library.id,
                    library.root.display()
                )));
            }
        }

        let mut client_ids = HashSet::new();
        for client in &self.clients {
            if !client_ids.insert(client.id.as_str()) {
                return Err(ServerError::Config(format!(
                    "duplicate client id: {}",
                    client.id
                )));
            }
        }
        for library in &self.libraries {
            for label in &library.authorized_clients {
                if !client_ids.contains(label.as_str()) {
                    return Err(ServerError::Config(format!(
                        "library {} authorizes unknown client {label}",
                        library.id
                    )));
                }
            }
        }

        for fingerprint in &self.security.revoked_fingerprints {
            if fingerprint.len() != 64 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ServerError::Config(format!(
                    "revoked fingerprint is not hex SHA-256: {fingerprint}"
                )));
            }
        }

        Ok(())
    }
}
