//! Protocol error taxonomy.
//!
//! [`ProtoError`] covers codec-level failures (framing, digests, malformed
//! payloads). [`ErrorKind`] is the closed set of error kinds every response
//! can carry; it is the single basis for status-code mapping on the server
//! and retry classification on the client.

use crate::frame::Status;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Codec-level errors. Any of these on a live connection is fatal for that
/// connection.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Peer speaks a different frame version
    #[error("unsupported protocol version {0}")]
    Version(u16),

    /// Invalid message kind byte
    #[error("invalid message kind: 0x{0:02X}")]
    InvalidKind(u8),

    /// Invalid command byte
    #[error("invalid command: 0x{0:02X}")]
    InvalidCommand(u8),

    /// Invalid status byte
    #[error("invalid status: 0x{0:02X}")]
    InvalidStatus(u8),

    /// Declared payload length exceeds the limit
    #[error("payload length {got} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Declared length
        got: u32,
        /// Configured maximum
        max: u32,
    },

    /// Declared body length exceeds the limit
    #[error("body length {got} exceeds maximum {max}")]
    BodyTooLarge {
        /// Declared length
        got: u32,
        /// Configured maximum
        max: u32,
    },

    /// Recomputed digest does not match the header digest
    #[error("frame digest mismatch")]
    DigestMismatch,

    /// Payload is not valid JSON for the declared command
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// A structurally valid frame arrived where it is not allowed
    #[error("unexpected {got:?} frame while {context}")]
    UnexpectedFrame {
        /// Command of the offending frame
        got: crate::frame::Command,
        /// What the receiver was doing
        context: &'static str,
    },

    /// Underlying transport failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The closed set of error kinds a response can carry.
///
/// Serialized in kebab-case inside [`ErrorBody`]; the wire strings are part
/// of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Connection closed, TLS failure, read/write timeout
    Transport,
    /// Malformed frame, frame digest mismatch, unknown or out-of-state command
    Protocol,
    /// Protocol version negotiation failed
    VersionMismatch,
    /// Bad, revoked, or unknown client certificate
    Authentication,
    /// Authenticated client is not permitted for the requested library
    NotPermitted,
    /// Target does not exist
    NotFound,
    /// Target already exists
    AlreadyExists,
    /// A conflicting lock is held on the target
    Locked,
    /// Rate budget exhausted
    RateLimited,
    /// No space left on the library volume
    DiskFull,
    /// Full-file digest did not match the advertised digest
    ChecksumMismatch,
    /// Path escapes the library root or contains forbidden components
    PathTraversal,
    /// Parameter outside its contract
    InvalidArgument,
    /// Payload or body larger than the negotiated limits
    SizeTooLarge,
    /// Unexpected server-side failure; details stay in the server log
    Internal,
}

impl ErrorKind {
    /// Status byte this kind travels under.
    #[must_use]
    pub fn status(self) -> Status {
        match self {
            ErrorKind::Transport | ErrorKind::Protocol => Status::BadRequest,
            ErrorKind::VersionMismatch => Status::VersionMismatch,
            ErrorKind::Authentication => Status::Unauthorized,
            ErrorKind::NotPermitted => Status::Forbidden,
            ErrorKind::NotFound => Status::NotFound,
            ErrorKind::AlreadyExists | ErrorKind::Locked => Status::Conflict,
            ErrorKind::RateLimited => Status::RateLimited,
            ErrorKind::ChecksumMismatch => Status::ChecksumMismatch,
            ErrorKind::PathTraversal | ErrorKind::InvalidArgument | ErrorKind::SizeTooLarge => {
                Status::BadRequest
            }
            ErrorKind::DiskFull | ErrorKind::Internal => Status::Internal,
        }
    }

    /// Whether a client should retry the whole operation with backoff.
    ///
    /// Transient kinds are transport failures, lock contention, and rate
    /// pushback; everything else is permanent and propagates immediately.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Transport | ErrorKind::Locked | ErrorKind::RateLimited
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The wire spelling doubles as the display form.
        let s = serde_json::to_value(self).map_err(|_| std::fmt::Error)?;
        match s {
            serde_json::Value::String(s) => f.write_str(&s),
            _ => Err(std::fmt::Error),
        }
    }
}

/// Error object carried in the payload of a non-OK response.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ErrorBody {
    /// Error kind, authoritative for client behavior
    pub kind: ErrorKind,
    /// Human-readable context
    pub message: String,
}

impl ErrorBody {
    /// Build an error body.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_spelling_is_kebab_case() {
        let json = serde_json::to_string(&ErrorKind::ChecksumMismatch).unwrap();
        assert_eq!(json, "\"checksum-mismatch\"");
        let back: ErrorKind = serde_json::from_str("\"path-traversal\"").unwrap();
        assert_eq!(back, ErrorKind::PathTraversal);
    }

    #[test]
    fn status_mapping_is_total() {
        let kinds = [
            ErrorKind::Transport,
            ErrorKind::Protocol,
            ErrorKind::VersionMismatch,
            ErrorKind::Authentication,
            ErrorKind::NotPermitted,
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::Locked,
            ErrorKind::RateLimited,
            ErrorKind::DiskFull,
            ErrorKind::ChecksumMismatch,
            ErrorKind::PathTraversal,
            ErrorKind::InvalidArgument,
            ErrorKind::SizeTooLarge,
            ErrorKind::Internal,
        ];
        for kind in kinds {
            assert_ne!(kind.status(), Status::Ok, "{kind} must not map to OK");
        }
    }

    #[test]
    fn transient_kinds() {
        assert!(ErrorKind::Transport.is_transient());
        assert!(ErrorKind::Locked.is_transient());
        assert!(ErrorKind::RateLimited.is_transient());

        assert!(!ErrorKind::ChecksumMismatch.is_transient());
        assert!(!ErrorKind::NotFound.is_transient());
        assert!(!ErrorKind::PathTraversal.is_transient());
        assert!(!ErrorKind::NotPermitted.is_transient());
        assert!(!ErrorKind::Authentication.is_transient());
    }

    #[test]
    fn authn_and_authz_statuses_are_distinct() {
        assert_eq!(ErrorKind::Authentication.status(), Status::Unauthorized);
        assert_eq!(ErrorKind::NotPermitted.status(), Status::Forbidden);
    }

    #[test]
    fn error_body_roundtrip() {
        let body = ErrorBody::new(ErrorKind::Locked, "a.bin is being written");
        let json = serde_json::to_vec(&body).unwrap();
        let back: ErrorBody = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::Locked);
        assert_eq!(back.message, "a.bin is being written");
    }
}
