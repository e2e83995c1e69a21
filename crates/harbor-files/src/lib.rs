//! # Harbor Files
//!
//! File primitives for FileHarbor:
//! - **Path resolution**: maps client-supplied relative paths to absolute
//!   paths under a library root, rejecting every way out
//! - **Streamed digests**: SHA-256 over file contents without loading them
//! - **File operations**: the primitive read/write/list/rename/delete/stat
//!   surface the server dispatches into
//! - **Upload staging**: `.partial` files that are promoted to their final
//!   path only on a verified commit
//!
//! Every operation takes a pre-resolved absolute path; resolution through
//! [`resolver::resolve`] is the single entry point for untrusted paths.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hasher;
pub mod ops;
pub mod resolver;
pub mod staging;

pub use error::FilesError;
pub use resolver::resolve;
pub use staging::{STAGING_SUFFIX, UploadStaging, staging_path};

/// Read buffer size for streamed hashing and chunked reads
pub const IO_BUF_SIZE: usize = 64 * 1024;
