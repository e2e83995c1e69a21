//! Typed request and reply payloads for every command.
//!
//! The command byte in the frame header selects which JSON shape the payload
//! carries. [`Request`] is the tagged variant the server's connection handler
//! dispatches over; reply payloads are plain structs the client decodes by
//! the command it sent.

use crate::error::{ErrorBody, ErrorKind, ProtoError};
use crate::frame::{Command, Frame, MessageKind, Status};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// `HANDSHAKE` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Library the session will be bound to
    pub library_id: String,
    /// Client's protocol version
    pub protocol_version: u16,
}

/// `HANDSHAKE` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// Session id, unique per server lifetime
    pub session_id: u64,
    /// Server's protocol version
    pub protocol_version: u16,
    /// Server's preferred chunk size in bytes
    pub chunk_size: u32,
}

/// Single-path parameters (`PUT_COMMIT`, `DELETE`, `MKDIR`, `MANIFEST`,
/// `CHECKSUM`, `STAT`, `EXISTS`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    /// Library-relative path
    pub path: String,
}

/// `PUT_START` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutStartRequest {
    /// Library-relative destination path
    pub path: String,
    /// Total file size the client will upload
    pub size: u64,
    /// Hex SHA-256 of the complete file
    pub digest: String,
    /// Modification time to restore on commit (seconds since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
}

/// `PUT_START` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutStartReply {
    /// Byte offset the client must resume from (0 for a fresh upload)
    pub resume_offset: u64,
}

/// `PUT_CHUNK` parameters; the chunk bytes ride in the frame body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutChunkRequest {
    /// Library-relative destination path
    pub path: String,
    /// Offset this chunk starts at; must equal the committed length
    pub offset: u64,
}

/// `PUT_CHUNK` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutChunkReply {
    /// Committed length after this chunk
    pub committed: u64,
}

/// `PUT_COMMIT` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutCommitReply {
    /// Final file size
    pub size: u64,
    /// Hex SHA-256 of the final file
    pub digest: String,
}

/// `GET_START` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStartRequest {
    /// Library-relative source path
    pub path: String,
    /// Resume offset (0 for a fresh download)
    pub offset: u64,
}

/// `GET_START` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStartReply {
    /// Total file size
    pub size: u64,
    /// Hex SHA-256 of the complete file
    pub digest: String,
    /// Offset streaming will begin at (equals the requested offset)
    pub offset: u64,
    /// File modification time (seconds since epoch)
    pub mtime: u64,
}

/// `GET_CHUNK` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChunkRequest {
    /// Library-relative source path
    pub path: String,
    /// Offset to read from
    pub offset: u64,
    /// Maximum bytes the server may return
    pub len: u32,
}

/// `GET_CHUNK` reply; the chunk bytes ride in the frame body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChunkReply {
    /// Offset the body starts at
    pub offset: u64,
    /// Body length in bytes
    pub len: u32,
    /// Whether the body reaches the end of the file
    pub eof: bool,
}

/// `RENAME` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRequest {
    /// Existing library-relative path
    pub from: String,
    /// New library-relative path
    pub to: String,
}

/// `LIST` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRequest {
    /// Library-relative directory ("" for the root)
    pub path: String,
    /// Whether to descend into subdirectories
    pub recursive: bool,
}

/// Entry kind in listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Dir,
}

/// One `LIST` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    /// Path relative to the listed directory
    pub path: String,
    /// File or directory
    pub kind: EntryKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Modification time (seconds since epoch)
    pub mtime: u64,
}

/// `LIST` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListReply {
    /// Entries in traversal order
    pub entries: Vec<DirEntry>,
}

/// `RMDIR` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmdirRequest {
    /// Library-relative directory
    pub path: String,
    /// Remove contents too; a non-empty directory fails otherwise
    pub recursive: bool,
}

/// One `MANIFEST` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the manifest root
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time (seconds since epoch)
    pub mtime: u64,
    /// Hex SHA-256 of the file
    pub digest: String,
}

/// `MANIFEST` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestReply {
    /// File entries in traversal order
    pub entries: Vec<ManifestEntry>,
}

/// `CHECKSUM` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumReply {
    /// File size in bytes
    pub size: u64,
    /// Hex SHA-256 of the file
    pub digest: String,
}

/// `STAT` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatReply {
    /// File or directory
    pub kind: EntryKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Modification time (seconds since epoch)
    pub mtime: u64,
    /// Hex SHA-256 (empty for directories)
    pub digest: String,
}

/// `EXISTS` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsReply {
    /// Whether the path exists within the library
    pub exists: bool,
}

/// Empty reply payload (`PING`, `DISCONNECT`, `DELETE`, `RENAME`, `MKDIR`,
/// `RMDIR`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptyReply {}

/// A decoded client request: the tagged variant the connection handler
/// dispatches over.
#[derive(Debug, Clone)]
pub enum Request {
    /// `HANDSHAKE`
    Handshake(HandshakeRequest),
    /// `PING`
    Ping,
    /// `DISCONNECT`
    Disconnect,
    /// `PUT_START`
    PutStart(PutStartRequest),
    /// `PUT_CHUNK` with its body bytes
    PutChunk(PutChunkRequest, Vec<u8>),
    /// `PUT_COMMIT`
    PutCommit(PathRequest),
    /// `GET_START`
    GetStart(GetStartRequest),
    /// `GET_CHUNK`
    GetChunk(GetChunkRequest),
    /// `DELETE`
    Delete(PathRequest),
    /// `RENAME`
    Rename(RenameRequest),
    /// `LIST`
    List(ListRequest),
    /// `MKDIR`
    Mkdir(PathRequest),
    /// `RMDIR`
    Rmdir(RmdirRequest),
    /// `MANIFEST`
    Manifest(PathRequest),
    /// `CHECKSUM`
    Checksum(PathRequest),
    /// `STAT`
    Stat(PathRequest),
    /// `EXISTS`
    Exists(PathRequest),
}

impl Request {
    /// Command byte this request travels under.
    #[must_use]
    pub fn command(&self) -> Command {
        match self {
            Request::Handshake(_) => Command::Handshake,
            Request::Ping => Command::Ping,
            Request::Disconnect => Command::Disconnect,
            Request::PutStart(_) => Command::PutStart,
            Request::PutChunk(..) => Command::PutChunk,
            Request::PutCommit(_) => Command::PutCommit,
            Request::GetStart(_) => Command::GetStart,
            Request::GetChunk(_) => Command::GetChunk,
            Request::Delete(_) => Command::Delete,
            Request::Rename(_) => Command::Rename,
            Request::List(_) => Command::List,
            Request::Mkdir(_) => Command::Mkdir,
            Request::Rmdir(_) => Command::Rmdir,
            Request::Manifest(_) => Command::Manifest,
            Request::Checksum(_) => Command::Checksum,
            Request::Stat(_) => Command::Stat,
            Request::Exists(_) => Command::Exists,
        }
    }

    /// Decode a request from an incoming frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtoError::Payload` for JSON that does not match the
    /// command's shape, and `ProtoError::UnexpectedFrame` when a bodiless
    /// command arrives as a DATA frame or vice versa.
    pub fn decode(frame: Frame) -> Result<Self, ProtoError> {
        if frame.command == Command::PutChunk {
            if frame.kind != MessageKind::Data {
                return Err(ProtoError::UnexpectedFrame {
                    got: frame.command,
                    context: "expecting chunk data",
                });
            }
        } else {
            if frame.kind != MessageKind::Request {
                return Err(ProtoError::UnexpectedFrame {
                    got: frame.command,
                    context: "expecting a request",
                });
            }
            if !frame.body.is_empty() {
                return Err(ProtoError::UnexpectedFrame {
                    got: frame.command,
                    context: "body on a bodiless command",
                });
            }
        }

        let request = match frame.command {
            Command::Handshake => Request::Handshake(serde_json::from_slice(&frame.payload)?),
            Command::Ping => Request::Ping,
            Command::Disconnect => Request::Disconnect,
            Command::PutStart => Request::PutStart(serde_json::from_slice(&frame.payload)?),
            Command::PutChunk => {
                Request::PutChunk(serde_json::from_slice(&frame.payload)?, frame.body)
            }
            Command::PutCommit => Request::PutCommit(serde_json::from_slice(&frame.payload)?),
            Command::GetStart => Request::GetStart(serde_json::from_slice(&frame.payload)?),
            Command::GetChunk => Request::GetChunk(serde_json::from_slice(&frame.payload)?),
            Command::Delete => Request::Delete(serde_json::from_slice(&frame.payload)?),
            Command::Rename => Request::Rename(serde_json::from_slice(&frame.payload)?),
            Command::List => Request::List(serde_json::from_slice(&frame.payload)?),
            Command::Mkdir => Request::Mkdir(serde_json::from_slice(&frame.payload)?),
            Command::Rmdir => Request::Rmdir(serde_json::from_slice(&frame.payload)?),
            Command::Manifest => Request::Manifest(serde_json::from_slice(&frame.payload)?),
            Command::Checksum => Request::Checksum(serde_json::from_slice(&frame.payload)?),
            Command::Stat => Request::Stat(serde_json::from_slice(&frame.payload)?),
            Command::Exists => Request::Exists(serde_json::from_slice(&frame.payload)?),
        };
        Ok(request)
    }

    /// Encode this request into a frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtoError::Payload` if serialization fails.
    pub fn into_frame(self) -> Result<Frame, ProtoError> {
        let command = self.command();
        let frame = match self {
            Request::Handshake(p) => Frame::request(command, serde_json::to_vec(&p)?),
            Request::Ping | Request::Disconnect => Frame::request(command, b"{}".to_vec()),
            Request::PutStart(p) => Frame::request(command, serde_json::to_vec(&p)?),
            Request::PutChunk(p, body) => {
                Frame::data_request(command, serde_json::to_vec(&p)?, body)
            }
            Request::PutCommit(p)
            | Request::Delete(p)
            | Request::Mkdir(p)
            | Request::Manifest(p)
            | Request::Checksum(p)
            | Request::Stat(p)
            | Request::Exists(p) => Frame::request(command, serde_json::to_vec(&p)?),
            Request::GetStart(p) => Frame::request(command, serde_json::to_vec(&p)?),
            Request::GetChunk(p) => Frame::request(command, serde_json::to_vec(&p)?),
            Request::Rename(p) => Frame::request(command, serde_json::to_vec(&p)?),
            Request::List(p) => Frame::request(command, serde_json::to_vec(&p)?),
            Request::Rmdir(p) => Frame::request(command, serde_json::to_vec(&p)?),
        };
        Ok(frame)
    }
}

/// Build a success response frame with a typed payload.
///
/// # Errors
///
/// Returns `ProtoError::Payload` if serialization fails.
pub fn ok_response<T: Serialize>(command: Command, payload: &T) -> Result<Frame, ProtoError> {
    Ok(Frame::response(
        command,
        Status::Ok,
        serde_json::to_vec(payload)?,
    ))
}

/// Build a success `GET_CHUNK` response carrying chunk bytes.
///
/// # Errors
///
/// Returns `ProtoError::Payload` if serialization fails.
pub fn data_response<T: Serialize>(
    command: Command,
    payload: &T,
    body: Vec<u8>,
) -> Result<Frame, ProtoError> {
    Ok(Frame::data_response(
        command,
        serde_json::to_vec(payload)?,
        body,
    ))
}

/// Build an error response frame for the given kind.
#[must_use]
pub fn error_response(command: Command, kind: ErrorKind, message: impl Into<String>) -> Frame {
    let body = ErrorBody::new(kind, message);
    let payload = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Frame::response(command, kind.status(), payload)
}

/// Decode a reply frame into the typed payload the caller expects, or the
/// error body the server sent.
///
/// # Errors
///
/// Returns `ProtoError::Payload` if the payload does not parse as either
/// shape.
pub fn decode_reply<T: DeserializeOwned>(frame: &Frame) -> Result<Result<T, ErrorBody>, ProtoError> {
    if frame.is_ok() {
        Ok(Ok(serde_json::from_slice(&frame.payload)?))
    } else {
        Ok(Err(serde_json::from_slice(&frame.payload)?))
    }
}
