//! Frame encoding and decoding for the FileHarbor wire protocol.
//!
//! A frame is `HEADER (48 bytes) || JSON payload || binary body`. All
//! multi-byte header fields are big-endian (network byte order). The header
//! carries a SHA-256 digest over `payload || body`; [`read_frame`] recomputes
//! and compares it before returning, so a decoded frame is always
//! integrity-checked.

use crate::error::ProtoError;
use crate::{FRAME_HEADER_SIZE, MAX_BODY_LEN, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Command with JSON parameters, no body
    Request = 0x01,
    /// Reply with status and JSON result, no body
    Response = 0x02,
    /// Request or reply that carries a binary body (chunk frames)
    Data = 0x03,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Data),
            _ => Err(ProtoError::InvalidKind(value)),
        }
    }
}

/// Command bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Open a session bound to one library
    Handshake = 0x01,
    /// Keep-alive / latency probe
    Ping = 0x02,
    /// Orderly session end
    Disconnect = 0x03,
    /// Begin (or resume) an upload
    PutStart = 0x10,
    /// Append one chunk to an active upload
    PutChunk = 0x11,
    /// Finalize an upload: verify digest, promote staging
    PutCommit = 0x12,
    /// Begin a download at an offset
    GetStart = 0x20,
    /// Fetch one chunk of an active download
    GetChunk = 0x21,
    /// Remove a file
    Delete = 0x30,
    /// Rename within the library
    Rename = 0x31,
    /// Enumerate directory entries
    List = 0x32,
    /// Create a directory (and parents)
    Mkdir = 0x33,
    /// Remove a directory
    Rmdir = 0x34,
    /// Recursive listing with per-file digests
    Manifest = 0x35,
    /// Full-file digest
    Checksum = 0x36,
    /// Size, mtime, digest of one path
    Stat = 0x37,
    /// Existence probe
    Exists = 0x38,
}

impl TryFrom<u8> for Command {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::Ping),
            0x03 => Ok(Self::Disconnect),
            0x10 => Ok(Self::PutStart),
            0x11 => Ok(Self::PutChunk),
            0x12 => Ok(Self::PutCommit),
            0x20 => Ok(Self::GetStart),
            0x21 => Ok(Self::GetChunk),
            0x30 => Ok(Self::Delete),
            0x31 => Ok(Self::Rename),
            0x32 => Ok(Self::List),
            0x33 => Ok(Self::Mkdir),
            0x34 => Ok(Self::Rmdir),
            0x35 => Ok(Self::Manifest),
            0x36 => Ok(Self::Checksum),
            0x37 => Ok(Self::Stat),
            0x38 => Ok(Self::Exists),
            _ => Err(ProtoError::InvalidCommand(value)),
        }
    }
}

/// Response status bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Command succeeded fully
    Ok = 0x00,
    /// Malformed or invalid request
    BadRequest = 0x01,
    /// Authentication failed
    Unauthorized = 0x02,
    /// Authenticated but not permitted
    Forbidden = 0x03,
    /// Target does not exist
    NotFound = 0x04,
    /// Lock contention or existing target
    Conflict = 0x05,
    /// Integrity verification failed
    ChecksumMismatch = 0x06,
    /// Rate budget exhausted
    RateLimited = 0x07,
    /// Protocol version negotiation failed
    VersionMismatch = 0x08,
    /// Unexpected server-side failure
    Internal = 0x09,
}

impl TryFrom<u8> for Status {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::BadRequest),
            0x02 => Ok(Self::Unauthorized),
            0x03 => Ok(Self::Forbidden),
            0x04 => Ok(Self::NotFound),
            0x05 => Ok(Self::Conflict),
            0x06 => Ok(Self::ChecksumMismatch),
            0x07 => Ok(Self::RateLimited),
            0x08 => Ok(Self::VersionMismatch),
            0x09 => Ok(Self::Internal),
            _ => Err(ProtoError::InvalidStatus(value)),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Protocol version the frame was encoded under
    pub version: u16,
    /// Message kind
    pub kind: MessageKind,
    /// Command
    pub command: Command,
    /// Status (zero on requests)
    pub status: Status,
    /// JSON payload length
    pub payload_len: u32,
    /// Binary body length
    pub body_len: u32,
    /// SHA-256 over payload || body
    pub digest: [u8; 32],
}

impl FrameHeader {
    /// Parse a header from exactly [`FRAME_HEADER_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns the matching `ProtoError` for an unsupported version, invalid
    /// kind/command/status byte, or a length above the configured maxima.
    pub fn parse(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, ProtoError> {
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != PROTOCOL_VERSION {
            return Err(ProtoError::Version(version));
        }

        let kind = MessageKind::try_from(buf[2])?;
        let command = Command::try_from(buf[3])?;
        let status = Status::try_from(buf[4])?;
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let body_len = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtoError::PayloadTooLarge {
                got: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        if body_len > MAX_BODY_LEN {
            return Err(ProtoError::BodyTooLarge {
                got: body_len,
                max: MAX_BODY_LEN,
            });
        }

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&buf[16..48]);

        Ok(Self {
            version,
            kind,
            command,
            status,
            payload_len,
            body_len,
            digest,
        })
    }
}

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Message kind
    pub kind: MessageKind,
    /// Command
    pub command: Command,
    /// Status; requests always carry [`Status::Ok`]
    pub status: Status,
    /// JSON payload bytes
    pub payload: Vec<u8>,
    /// Binary body bytes (empty except on chunk frames)
    pub body: Vec<u8>,
}

impl Frame {
    /// Build a bodiless request frame.
    #[must_use]
    pub fn request(command: Command, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Request,
            command,
            status: Status::Ok,
            payload,
            body: Vec::new(),
        }
    }

    /// Build a request frame carrying a binary body (`PUT_CHUNK`).
    #[must_use]
    pub fn data_request(command: Command, payload: Vec<u8>, body: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Data,
            command,
            status: Status::Ok,
            payload,
            body,
        }
    }

    /// Build a bodiless response frame.
    #[must_use]
    pub fn response(command: Command, status: Status, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Response,
            command,
            status,
            payload,
            body: Vec::new(),
        }
    }

    /// Build a response frame carrying a binary body (`GET_CHUNK`).
    #[must_use]
    pub fn data_response(command: Command, payload: Vec<u8>, body: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Data,
            command,
            status: Status::Ok,
            payload,
            body,
        }
    }

    /// Whether this frame reports success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Encode into a single wire buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let digest = frame_digest(&self.payload, &self.body);

        let mut buf =
            Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len() + self.body.len());
        buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        buf.push(self.kind as u8);
        buf.push(self.command as u8);
        buf.push(self.status as u8);
        buf.extend_from_slice(&[0u8; 3]); // Reserved
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&digest);
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// SHA-256 over `payload || body`.
fn frame_digest(payload: &[u8], body: &[u8]) -> [u8; 32] {
    let digest = Sha256::new()
        .chain_update(payload)
        .chain_update(body)
        .finalize();
    digest.into()
}

/// Write one frame to the stream and flush it.
///
/// # Errors
///
/// Propagates transport I/O errors.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode();
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from the stream, verifying lengths and the digest.
///
/// # Errors
///
/// Returns `ProtoError::DigestMismatch` when the recomputed digest differs
/// from the header digest, the matching error for any invalid header field,
/// and I/O errors (including a clean EOF, surfaced as `UnexpectedEof`).
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = FrameHeader::parse(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await?;
    let mut body = vec![0u8; header.body_len as usize];
    reader.read_exact(&mut body).await?;

    if frame_digest(&payload, &body) != header.digest {
        return Err(ProtoError::DigestMismatch);
    }

    Ok(Frame {
        kind: header.kind,
        command: header.command,
        status: header.status,
        payload,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(frame: &Frame) -> Frame {
        let mut buf = Vec::new();
        write_frame(&mut buf, frame).await.unwrap();
        read_frame(&mut buf.as_slice()).await.unwrap()
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let frame = Frame::data_request(
            Command::PutChunk,
            br#"{"path":"a.bin","offset":0}"#.to_vec(),
            b"Hello, FileHarbor!".to_vec(),
        );

        let parsed = roundtrip(&frame).await;
        assert_eq!(parsed.kind, MessageKind::Data);
        assert_eq!(parsed.command, Command::PutChunk);
        assert_eq!(parsed.status, Status::Ok);
        assert_eq!(parsed.payload, frame.payload);
        assert_eq!(parsed.body, b"Hello, FileHarbor!");
    }

    #[tokio::test]
    async fn test_empty_payload_and_body() {
        let frame = Frame::request(Command::Ping, b"{}".to_vec());
        let parsed = roundtrip(&frame).await;
        assert_eq!(parsed.command, Command::Ping);
        assert!(parsed.body.is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_body_is_rejected() {
        let frame = Frame::data_request(Command::PutChunk, b"{}".to_vec(), vec![0xAA; 64]);
        let mut bytes = frame.encode();
        // Flip one bit in the body.
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let err = read_frame(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtoError::DigestMismatch));
    }

    #[tokio::test]
    async fn test_corrupted_payload_is_rejected() {
        let frame = Frame::request(Command::Stat, br#"{"path":"x"}"#.to_vec());
        let mut bytes = frame.encode();
        bytes[FRAME_HEADER_SIZE] ^= 0x01;

        let err = read_frame(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtoError::DigestMismatch));
    }

    #[tokio::test]
    async fn test_version_rejected() {
        let mut bytes = Frame::request(Command::Ping, b"{}".to_vec()).encode();
        bytes[0] = 0xFF;
        bytes[1] = 0xFF;

        let err = read_frame(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtoError::Version(0xFFFF)));
    }

    #[tokio::test]
    async fn test_invalid_command_rejected() {
        let mut bytes = Frame::request(Command::Ping, b"{}".to_vec()).encode();
        bytes[3] = 0x7F;

        let err = read_frame(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtoError::InvalidCommand(0x7F)));
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let mut bytes = Frame::request(Command::Ping, b"{}".to_vec()).encode();
        bytes[8..12].copy_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());

        let err = read_frame(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtoError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_oversize_body_rejected() {
        let mut bytes = Frame::request(Command::Ping, b"{}".to_vec()).encode();
        bytes[12..16].copy_from_slice(&(MAX_BODY_LEN + 1).to_be_bytes());

        let err = read_frame(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtoError::BodyTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let bytes = Frame::request(Command::Stat, br#"{"path":"x"}"#.to_vec()).encode();
        let truncated = &bytes[..bytes.len() - 4];

        let err = read_frame(&mut &truncated[..]).await.unwrap_err();
        assert!(matches!(err, ProtoError::Io(_)));
    }

    #[test]
    fn test_all_commands_roundtrip_bytes() {
        let commands = [
            Command::Handshake,
            Command::Ping,
            Command::Disconnect,
            Command::PutStart,
            Command::PutChunk,
            Command::PutCommit,
            Command::GetStart,
            Command::GetChunk,
            Command::Delete,
            Command::Rename,
            Command::List,
            Command::Mkdir,
            Command::Rmdir,
            Command::Manifest,
            Command::Checksum,
            Command::Stat,
            Command::Exists,
        ];
        for command in commands {
            assert_eq!(Command::try_from(command as u8).unwrap(), command);
        }
    }

    #[test]
    fn test_all_statuses_roundtrip_bytes() {
        for byte in 0x00u8..=0x09 {
            let status = Status::try_from(byte).unwrap();
            assert_eq!(status as u8, byte);
        }
        assert!(Status::try_from(0x0A).is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_parse_doesnt_panic(data in prop::collection::vec(any::<u8>(), 0..256)) {
                if data.len() >= FRAME_HEADER_SIZE {
                    let mut buf = [0u8; FRAME_HEADER_SIZE];
                    buf.copy_from_slice(&data[..FRAME_HEADER_SIZE]);
                    let _ = FrameHeader::parse(&buf);
                }
            }

            #[test]
            fn prop_roundtrip_preserves_data(
                payload in prop::collection::vec(any::<u8>(), 0..1024),
                body in prop::collection::vec(any::<u8>(), 0..4096),
            ) {
                let frame = Frame::data_request(Command::PutChunk, payload.clone(), body.clone());
                let bytes = frame.encode();

                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                let parsed = rt.block_on(read_frame(&mut bytes.as_slice())).unwrap();
                prop_assert_eq!(parsed.payload, payload);
                prop_assert_eq!(parsed.body, body);
            }

            #[test]
            fn prop_any_single_flip_is_detected(
                body in prop::collection::vec(any::<u8>(), 1..512),
                flip in any::<usize>(),
            ) {
                let frame = Frame::data_request(Command::PutChunk, b"{}".to_vec(), body);
                let mut bytes = frame.encode();
                // Flip one bit somewhere past the header.
                let idx = FRAME_HEADER_SIZE + flip % (bytes.len() - FRAME_HEADER_SIZE);
                bytes[idx] ^= 0x01;

                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                let result = rt.block_on(read_frame(&mut bytes.as_slice()));
                prop_assert!(result.is_err());
            }
        }
    }
}
