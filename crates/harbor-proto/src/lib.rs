//! # Harbor Proto
//!
//! Wire protocol for FileHarbor: the framed request/response/data codec
//! carried over the mutually authenticated TLS channel.
//!
//! This crate provides:
//! - **Frame encoding and decoding**: fixed 48-byte header, JSON payload,
//!   optional binary body, per-frame SHA-256 digest
//! - **Command and status bytes**: the closed command set and its response
//!   status codes
//! - **Typed messages**: request and reply payload structures for every
//!   command
//! - **Error taxonomy**: the closed [`ErrorKind`] set shared by server and
//!   client, with status-code mapping and retry classification
//!
//! A frame on the wire is `HEADER || JSON payload || binary body`. The header
//! carries both lengths and a digest over `payload || body`; receivers
//! recompute and compare the digest before acting on anything. Only
//! `PUT_CHUNK` requests and `GET_CHUNK` responses carry a body.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod message;

pub use error::{ErrorBody, ErrorKind, ProtoError};
pub use frame::{Command, Frame, FrameHeader, MessageKind, Status, read_frame, write_frame};
pub use message::Request;

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 48;

/// Maximum JSON payload length (64 KiB)
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024;

/// Maximum binary body length (16 MiB); bounds the negotiable chunk size
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;
