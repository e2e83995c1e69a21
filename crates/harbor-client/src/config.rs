//! Client configuration.

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server endpoint
    pub server: ServerEndpoint,
    /// Certificates and key
    pub identity: IdentityConfig,
    /// Transfer tuning
    pub transfer: TransferSettings,
}

/// Server endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Hostname the server certificate is valid for
    pub host: String,
    /// Port
    pub port: u16,
}

/// Certificates and key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Client certificate (PEM)
    pub certificate: PathBuf,
    /// Client private key (PEM)
    pub private_key: PathBuf,
    /// CA certificate the server is verified against (PEM)
    pub ca_certificate: PathBuf,
}

/// Transfer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Library to bind the session to
    pub library: String,
    /// Preferred chunk size in bytes; the server may hint smaller
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Attempts per operation on transient failures
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_chunk_size() -> u32 {
    1024 * 1024 // 1 MiB
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_connect_timeout() -> u64 {
    10
}

impl ClientConfig {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// `ClientError::Config` for unreadable, unparsable, or invalid
    /// documents.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ClientError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Connect timeout as a duration.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.connect_timeout_secs)
    }

    /// Validate: nonempty endpoint and library, sane chunk size.
    ///
    /// # Errors
    ///
    /// `ClientError::Config` naming the first violation.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.server.host.is_empty() {
            return Err(ClientError::Config("server host must be nonempty".into()));
        }
        if self.server.port == 0 {
            return Err(ClientError::Config("server port must be nonzero".into()));
        }
        if self.transfer.library.is_empty() {
            return Err(ClientError::Config("library must be nonempty".into()));
        }
        if self.transfer.chunk_size == 0
            || self.transfer.chunk_size > harbor_proto::MAX_BODY_LEN
        {
            return Err(ClientError::Config(format!(
                "chunk_size must be between 1 and {}",
                harbor_proto::MAX_BODY_LEN
            )));
        }
        if self.transfer.retry_attempts == 0 {
            return Err(ClientError::Config("retry_attempts must be nonzero".into()));
        }
        Ok(())
    }
}
