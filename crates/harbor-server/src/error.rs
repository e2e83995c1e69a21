//! Server error type and its wire mapping.
//!
//! The connection handler's top level is the only place errors become wire
//! status codes: [`ServerError::wire_kind`] yields the response kind for
//! errors that stay on the connection, and `None` for transport-level
//! failures that terminate it.

use harbor_files::FilesError;
use harbor_proto::{ErrorKind, ProtoError};
use thiserror::Error;

/// Errors raised while serving.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Codec-level protocol violation; fatal for the connection
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// File primitive failure, carries its own wire kind
    #[error(transparent)]
    Files(#[from] FilesError),

    /// Peer certificate rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Authenticated client not permitted for the library
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// Handshake named a library the server does not expose
    #[error("unknown library: {0}")]
    UnknownLibrary(String),

    /// Lock contention; distinct and retryable
    #[error("locked: {0}")]
    Locked(String),

    /// Request parameter outside its contract
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Handshake version negotiation failed
    #[error("protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        /// Version the client offered
        client: u16,
        /// Version this server speaks
        server: u16,
    },

    /// Session cancelled by the reaper or shutdown
    #[error("session cancelled")]
    Cancelled,

    /// Per-frame read timeout expired
    #[error("read timeout")]
    Timeout,

    /// Transport failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Wire kind for errors answered on the connection; `None` means the
    /// connection terminates instead (transport and codec failures).
    #[must_use]
    pub fn wire_kind(&self) -> Option<ErrorKind> {
        match self {
            ServerError::Files(e) => Some(e.kind()),
            ServerError::Auth(_) => Some(ErrorKind::Authentication),
            ServerError::NotPermitted(_) => Some(ErrorKind::NotPermitted),
            ServerError::UnknownLibrary(_) => Some(ErrorKind::NotFound),
            ServerError::Locked(_) => Some(ErrorKind::Locked),
            ServerError::Invalid(_) => Some(ErrorKind::InvalidArgument),
            ServerError::VersionMismatch { .. } => Some(ErrorKind::VersionMismatch),
            ServerError::Proto(_)
            | ServerError::Io(_)
            | ServerError::Tls(_)
            | ServerError::Config(_)
            | ServerError::Cancelled
            | ServerError::Timeout => None,
        }
    }
}
