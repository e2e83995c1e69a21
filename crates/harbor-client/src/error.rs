//! Client error type and retry classification.

use harbor_proto::{ErrorBody, ErrorKind, ProtoError};
use thiserror::Error;

/// Errors surfaced by the client engine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS material or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Codec-level protocol violation
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// The server answered with an error; the kind drives retry behavior
    #[error("server: {0}")]
    Server(#[from] ErrorBody),

    /// A downloaded file failed local digest verification
    #[error("checksum mismatch for {path}: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// Remote path
        path: String,
        /// Digest the server advertised
        expected: String,
        /// Digest computed over the received bytes
        computed: String,
    },

    /// Could not reach the server in time
    #[error("connect timeout")]
    ConnectTimeout,

    /// Transport failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether the whole operation should be retried with backoff.
    ///
    /// Transient: transport failures (including timeouts and mid-stream
    /// protocol corruption) and the server's retryable kinds (`locked`,
    /// `rate-limited`). Everything else propagates immediately.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Server(body) => body.kind.is_transient(),
            ClientError::Io(_) | ClientError::ConnectTimeout => true,
            ClientError::Proto(ProtoError::Io(_) | ProtoError::DigestMismatch) => true,
            _ => false,
        }
    }

    /// The server-reported kind, if this error came off the wire.
    #[must_use]
    pub fn server_kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Server(body) => Some(body.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: ErrorKind) -> ClientError {
        ClientError::Server(ErrorBody::new(kind, "test"))
    }

    #[test]
    fn transient_classification() {
        assert!(server(ErrorKind::Locked).is_transient());
        assert!(server(ErrorKind::RateLimited).is_transient());
        assert!(ClientError::ConnectTimeout.is_transient());
        assert!(
            ClientError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "x"))
                .is_transient()
        );
        assert!(ClientError::Proto(ProtoError::DigestMismatch).is_transient());
    }

    #[test]
    fn permanent_classification() {
        assert!(!server(ErrorKind::NotFound).is_transient());
        assert!(!server(ErrorKind::ChecksumMismatch).is_transient());
        assert!(!server(ErrorKind::PathTraversal).is_transient());
        assert!(!server(ErrorKind::NotPermitted).is_transient());
        assert!(!server(ErrorKind::Authentication).is_transient());
        assert!(!ClientError::ChecksumMismatch {
            path: "x".into(),
            expected: "a".into(),
            computed: "b".into()
        }
        .is_transient());
        assert!(!ClientError::Config("bad".into()).is_transient());
    }

    #[test]
    fn server_kind_extraction() {
        assert_eq!(
            server(ErrorKind::Locked).server_kind(),
            Some(ErrorKind::Locked)
        );
        assert_eq!(ClientError::ConnectTimeout.server_kind(), None);
    }
}
