//! Error type for file primitives.

use harbor_proto::ErrorKind;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Errors from path resolution and file operations.
#[derive(Debug, Error)]
pub enum FilesError {
    /// Path escapes the library root or contains forbidden components
    #[error("path traversal: {0}")]
    Traversal(String),

    /// Target does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Target already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Directory removal refused because it has contents
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Expected a directory
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a regular file
    #[error("not a file: {0}")]
    NotAFile(String),

    /// Parameter outside its contract (bad offset, oversize write, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Committed upload digest does not match the advertised digest
    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// Digest advertised at upload start
        expected: String,
        /// Digest computed over the staged bytes
        computed: String,
    },

    /// No space left on the library volume
    #[error("disk full")]
    DiskFull,

    /// Any other I/O failure
    #[error(transparent)]
    Io(io::Error),
}

impl FilesError {
    /// Map into the wire error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            FilesError::Traversal(_) => ErrorKind::PathTraversal,
            FilesError::NotFound(_) => ErrorKind::NotFound,
            FilesError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FilesError::NotEmpty(_)
            | FilesError::NotADirectory(_)
            | FilesError::NotAFile(_)
            | FilesError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FilesError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            FilesError::DiskFull => ErrorKind::DiskFull,
            FilesError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Classify an I/O error against the path it happened on.
    pub(crate) fn from_io(err: io::Error, path: &Path) -> Self {
        let display = path.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => FilesError::NotFound(display),
            io::ErrorKind::AlreadyExists => FilesError::AlreadyExists(display),
            io::ErrorKind::StorageFull => FilesError::DiskFull,
            _ => FilesError::Io(err),
        }
    }
}
