//! Per-connection state machine.
//!
//! `AWAITING_HANDSHAKE -> AUTHENTICATED (command loop) -> CLOSING`. The
//! first frame must be `HANDSHAKE`; after that, frames are consumed and
//! answered strictly in order. Chunk commands traverse the library's rate
//! limiter before I/O. Every suspension point sits under the session's
//! cancellation signal and the server shutdown signal.
//!
//! This module is the only place errors become wire status codes: transport
//! and codec failures terminate the connection (codec ones after a
//! best-effort error frame); everything else is answered and the loop
//! continues.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::library::{Library, LibraryManager};
use crate::limiter::RateLimiter;
use crate::registry::{DownloadState, LockMode, Session, SessionRegistry};
use harbor_files::{ops, UploadStaging};
use harbor_proto::message::{
    self, EmptyReply, ExistsReply, GetChunkReply, GetStartReply, HandshakeReply, ListReply,
    ManifestReply, ChecksumReply, PutChunkReply, PutCommitReply, PutStartReply,
};
use harbor_proto::{
    read_frame, write_frame, Command, ErrorKind, Frame, ProtoError, Request, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::server::TlsStream;

/// Immutable state shared by every connection.
pub struct ServerContext {
    /// Validated configuration
    pub config: Arc<ServerConfig>,
    /// Certificate -> client record resolution
    pub authenticator: Authenticator,
    /// The library set
    pub libraries: Arc<LibraryManager>,
    /// Live sessions, locks, reaper state
    pub registry: Arc<SessionRegistry>,
    limiters: HashMap<String, Arc<RateLimiter>>,
    unbounded: Arc<RateLimiter>,
}

impl ServerContext {
    /// Build the shared context from a validated configuration.
    ///
    /// # Errors
    ///
    /// Configuration-level failures from the authenticator or library
    /// manager.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let authenticator = Authenticator::from_config(&config)?;
        let libraries = Arc::new(LibraryManager::from_config(&config, &authenticator)?);
        let limiters = libraries
            .iter()
            .map(|l| (l.id.clone(), Arc::new(RateLimiter::new(l.rate_cap))))
            .collect();

        Ok(Self {
            config: Arc::new(config),
            authenticator,
            libraries,
            registry: Arc::new(SessionRegistry::new()),
            limiters,
            unbounded: Arc::new(RateLimiter::new(0)),
        })
    }

    /// Rate limiter for a library.
    #[must_use]
    pub fn limiter(&self, library_id: &str) -> Arc<RateLimiter> {
        self.limiters
            .get(library_id)
            .map_or_else(|| Arc::clone(&self.unbounded), Arc::clone)
    }
}

/// Serve one accepted TLS connection to completion.
pub async fn serve_connection(
    mut stream: TlsStream<TcpStream>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    match handshake(&mut stream, peer, &ctx, &mut shutdown).await {
        Ok(Some((session, library))) => {
            let result = command_loop(&mut stream, &session, &library, &ctx, &mut shutdown).await;
            let (bytes_in, bytes_out) = session.bytes_moved();
            match result {
                Ok(()) => tracing::debug!(
                    session = session.id,
                    %peer,
                    bytes_in,
                    bytes_out,
                    "connection closed"
                ),
                Err(err) => {
                    tracing::debug!(
                        session = session.id,
                        %peer,
                        bytes_in,
                        bytes_out,
                        %err,
                        "connection terminated"
                    )
                }
            }
            ctx.registry.remove(session.id).await;
        }
        Ok(None) => {}
        Err(err) => tracing::debug!(%peer, %err, "handshake aborted"),
    }
    let _ = stream.shutdown().await;
}

/// AWAITING_HANDSHAKE: read the first frame, authenticate, authorize, bind
/// the session. `Ok(None)` means the peer was answered with an error and the
/// connection closes without a session.
async fn handshake(
    stream: &mut TlsStream<TcpStream>,
    peer: SocketAddr,
    ctx: &Arc<ServerContext>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<(Arc<Session>, Library)>, ServerError> {
    let frame = tokio::select! {
        result = tokio::time::timeout(ctx.config.read_timeout(), read_frame(stream)) => {
            match result {
                Err(_) => return Err(ServerError::Timeout),
                Ok(Err(err)) => return Err(err.into()),
                Ok(Ok(frame)) => frame,
            }
        }
        _ = shutdown.changed() => return Err(ServerError::Cancelled),
    };

    let request = match Request::decode(frame) {
        Ok(request) => request,
        Err(err) => {
            let response =
                message::error_response(Command::Handshake, ErrorKind::Protocol, err.to_string());
            let _ = write_frame(stream, &response).await;
            return Err(err.into());
        }
    };
    let Request::Handshake(params) = request else {
        let response = message::error_response(
            Command::Handshake,
            ErrorKind::Protocol,
            "first frame must be HANDSHAKE",
        );
        let _ = write_frame(stream, &response).await;
        return Ok(None);
    };

    match open_session(ctx, &params.library_id, params.protocol_version, peer, stream) {
        Ok((session, library)) => {
            let reply = message::ok_response(
                Command::Handshake,
                &HandshakeReply {
                    session_id: session.id,
                    protocol_version: PROTOCOL_VERSION,
                    chunk_size: ctx.config.network.chunk_size,
                },
            )?;
            write_frame(stream, &reply).await?;
            Ok(Some((session, library)))
        }
        Err(err) => {
            let kind = err.wire_kind().unwrap_or(ErrorKind::Internal);
            tracing::info!(
                target: "audit",
                %peer,
                library = %params.library_id,
                %err,
                "handshake rejected"
            );
            let response = message::error_response(Command::Handshake, kind, err.to_string());
            let _ = write_frame(stream, &response).await;
            Ok(None)
        }
    }
}

/// Authenticate the peer certificate, check the library, create the session.
fn open_session(
    ctx: &Arc<ServerContext>,
    library_id: &str,
    client_version: u16,
    peer: SocketAddr,
    stream: &TlsStream<TcpStream>,
) -> Result<(Arc<Session>, Library), ServerError> {
    if client_version != PROTOCOL_VERSION {
        return Err(ServerError::VersionMismatch {
            client: client_version,
            server: PROTOCOL_VERSION,
        });
    }

    let peer_certs: Vec<_> = stream
        .get_ref()
        .1
        .peer_certificates()
        .map(<[_]>::to_vec)
        .unwrap_or_default();
    let record = ctx.authenticator.authenticate(&peer_certs)?;

    let library = ctx
        .libraries
        .lookup(library_id)
        .ok_or_else(|| ServerError::UnknownLibrary(library_id.to_string()))?;
    if !library.is_authorized(&record.fingerprint) {
        return Err(ServerError::NotPermitted(format!(
            "client {} is not authorized for library {library_id}",
            record.label
        )));
    }

    let session = ctx.registry.create(record, library, peer);
    tracing::info!(
        target: "audit",
        session = session.id,
        client = %record.label,
        library = %library_id,
        %peer,
        "session opened"
    );
    Ok((session, library.clone()))
}

/// AUTHENTICATED: the command loop. Returns when the peer disconnects, the
/// session is cancelled, or a transport/protocol error ends the connection.
async fn command_loop(
    stream: &mut TlsStream<TcpStream>,
    session: &Arc<Session>,
    library: &Library,
    ctx: &Arc<ServerContext>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let mut cancel = session.cancelled();
    let read_timeout = ctx.config.read_timeout();

    loop {
        let frame = tokio::select! {
            result = tokio::time::timeout(read_timeout, read_frame(stream)) => match result {
                Err(_) => return Err(ServerError::Timeout),
                Ok(Err(ProtoError::Io(err)))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    // Peer closed without DISCONNECT; clean enough.
                    return Ok(());
                }
                Ok(Err(err)) => {
                    let response = message::error_response(
                        Command::Ping,
                        ErrorKind::Protocol,
                        err.to_string(),
                    );
                    let _ = write_frame(stream, &response).await;
                    return Err(err.into());
                }
                Ok(Ok(frame)) => frame,
            },
            _ = cancel.changed() => return Err(ServerError::Cancelled),
            _ = shutdown.changed() => return Err(ServerError::Cancelled),
        };

        session.touch();
        let command = frame.command;

        let request = match Request::decode(frame) {
            Ok(request) => request,
            Err(err) => {
                let response =
                    message::error_response(command, ErrorKind::Protocol, err.to_string());
                let _ = write_frame(stream, &response).await;
                return Err(err.into());
            }
        };

        match request {
            Request::Disconnect => {
                let reply = message::ok_response(Command::Disconnect, &EmptyReply {})?;
                write_frame(stream, &reply).await?;
                return Ok(());
            }
            Request::Handshake(_) => {
                let response = message::error_response(
                    command,
                    ErrorKind::Protocol,
                    "session already established",
                );
                let _ = write_frame(stream, &response).await;
                return Err(ServerError::Proto(ProtoError::UnexpectedFrame {
                    got: Command::Handshake,
                    context: "session already established",
                }));
            }
            request => {
                let response = tokio::select! {
                    result = dispatch(ctx, session, library, request) => match result {
                        Ok(frame) => frame,
                        Err(ServerError::Cancelled) => return Err(ServerError::Cancelled),
                        Err(err) => {
                            let kind = err.wire_kind().unwrap_or_else(|| {
                                tracing::error!(session = session.id, %err, "internal error");
                                ErrorKind::Internal
                            });
                            if kind == ErrorKind::PathTraversal {
                                tracing::warn!(
                                    target: "audit",
                                    session = session.id,
                                    client = %session.client_label,
                                    %err,
                                    "path traversal rejected"
                                );
                            }
                            message::error_response(command, kind, err.to_string())
                        }
                    },
                    _ = cancel.changed() => return Err(ServerError::Cancelled),
                    _ = shutdown.changed() => return Err(ServerError::Cancelled),
                };
                write_frame(stream, &response).await?;
            }
        }
    }
}

/// Dispatch one decoded command against file ops through the resolver.
async fn dispatch(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    library: &Library,
    request: Request,
) -> Result<Frame, ServerError> {
    match request {
        Request::Ping => Ok(message::ok_response(Command::Ping, &EmptyReply {})?),

        Request::PutStart(params) => {
            require_file_path(&params.path)?;
            require_hex_digest(&params.digest)?;
            let resolved = library.resolve(&params.path)?;
            require_not_root(library, &resolved)?;

            let mut transfers = session.transfers.lock().await;
            if transfers.uploads.contains_key(&params.path) {
                return Err(ServerError::Invalid(format!(
                    "upload already active for {}",
                    params.path
                )));
            }

            ctx.registry
                .acquire_lock(session, library, &resolved, LockMode::ExclusiveWrite)?;
            let staging =
                match UploadStaging::open(&resolved, params.size, params.digest, params.mtime)
                    .await
                {
                    Ok(staging) => staging,
                    Err(err) => {
                        ctx.registry.release_lock(session, &resolved);
                        return Err(err.into());
                    }
                };

            let resume_offset = staging.resume_offset();
            transfers.uploads.insert(params.path.clone(), staging);
            tracing::debug!(
                session = session.id,
                path = %params.path,
                size = params.size,
                resume_offset,
                "upload started"
            );
            Ok(message::ok_response(
                Command::PutStart,
                &PutStartReply { resume_offset },
            )?)
        }

        Request::PutChunk(params, body) => {
            // Rate budget is spent before any disk I/O.
            ctx.limiter(&library.id).consume(body.len() as u64).await;

            let mut transfers = session.transfers.lock().await;
            let staging = transfers.uploads.get_mut(&params.path).ok_or_else(|| {
                ServerError::Invalid(format!("no active upload for {}", params.path))
            })?;
            let committed = staging.write_chunk(params.offset, &body).await?;
            session.add_bytes_in(body.len() as u64);
            Ok(message::ok_response(
                Command::PutChunk,
                &PutChunkReply { committed },
            )?)
        }

        Request::PutCommit(params) => {
            let mut transfers = session.transfers.lock().await;
            let staging = transfers.uploads.remove(&params.path).ok_or_else(|| {
                ServerError::Invalid(format!("no active upload for {}", params.path))
            })?;
            drop(transfers);

            let final_path = staging.final_path().to_path_buf();
            let result = staging.commit().await;
            ctx.registry.release_lock(session, &final_path);
            let (size, digest) = result?;

            tracing::info!(
                target: "audit",
                session = session.id,
                client = %session.client_label,
                library = %library.id,
                path = %params.path,
                size,
                "upload committed"
            );
            Ok(message::ok_response(
                Command::PutCommit,
                &PutCommitReply { size, digest },
            )?)
        }

        Request::GetStart(params) => {
            require_file_path(&params.path)?;
            let resolved = library.resolve(&params.path)?;

            let mut transfers = session.transfers.lock().await;
            if transfers.downloads.remove(&params.path).is_some() {
                // Restarted download; drop the previous hold.
                ctx.registry.release_lock(session, &resolved);
            }

            ctx.registry
                .acquire_lock(session, library, &resolved, LockMode::SharedRead)?;
            let stat = match ops::stat(&resolved).await {
                Ok(stat) if stat.kind == harbor_proto::message::EntryKind::File => stat,
                Ok(_) => {
                    ctx.registry.release_lock(session, &resolved);
                    return Err(harbor_files::FilesError::NotAFile(params.path.clone()).into());
                }
                Err(err) => {
                    ctx.registry.release_lock(session, &resolved);
                    return Err(err.into());
                }
            };
            let (size, digest, mtime) = (stat.size, stat.digest, stat.mtime);
            if params.offset > size {
                ctx.registry.release_lock(session, &resolved);
                return Err(ServerError::Invalid(format!(
                    "resume offset {} past end of {} ({size} bytes)",
                    params.offset, params.path
                )));
            }

            transfers.downloads.insert(
                params.path.clone(),
                DownloadState {
                    path: resolved,
                    size,
                    digest: digest.clone(),
                },
            );
            tracing::debug!(
                session = session.id,
                path = %params.path,
                size,
                offset = params.offset,
                "download started"
            );
            Ok(message::ok_response(
                Command::GetStart,
                &GetStartReply {
                    size,
                    digest,
                    offset: params.offset,
                    mtime,
                },
            )?)
        }

        Request::GetChunk(params) => {
            if params.len == 0 {
                return Err(ServerError::Invalid("chunk length must be nonzero".into()));
            }
            let max = params.len.min(harbor_proto::MAX_BODY_LEN) as usize;

            let transfers = session.transfers.lock().await;
            let download = transfers.downloads.get(&params.path).ok_or_else(|| {
                ServerError::Invalid(format!("no active download for {}", params.path))
            })?;
            let path = download.path.clone();
            drop(transfers);

            let (bytes, eof) = ops::read_chunk(&path, params.offset, max).await?;
            ctx.limiter(&library.id).consume(bytes.len() as u64).await;
            session.add_bytes_out(bytes.len() as u64);

            if eof {
                let mut transfers = session.transfers.lock().await;
                if transfers.downloads.remove(&params.path).is_some() {
                    ctx.registry.release_lock(session, &path);
                }
            }

            let reply = GetChunkReply {
                offset: params.offset,
                len: bytes.len() as u32,
                eof,
            };
            Ok(message::data_response(Command::GetChunk, &reply, bytes)?)
        }

        Request::Delete(params) => {
            require_file_path(&params.path)?;
            let resolved = library.resolve(&params.path)?;
            require_unlocked(ctx, library, &resolved)?;
            ops::delete(&resolved).await?;

            tracing::info!(
                target: "audit",
                session = session.id,
                client = %session.client_label,
                library = %library.id,
                path = %params.path,
                "file deleted"
            );
            Ok(message::ok_response(Command::Delete, &EmptyReply {})?)
        }

        Request::Rename(params) => {
            require_file_path(&params.from)?;
            require_file_path(&params.to)?;
            let from = library.resolve(&params.from)?;
            let to = library.resolve(&params.to)?;
            require_not_root(library, &from)?;
            require_not_root(library, &to)?;
            require_unlocked(ctx, library, &from)?;
            require_unlocked(ctx, library, &to)?;
            ops::rename(&from, &to).await?;

            tracing::info!(
                target: "audit",
                session = session.id,
                client = %session.client_label,
                library = %library.id,
                from = %params.from,
                to = %params.to,
                "file renamed"
            );
            Ok(message::ok_response(Command::Rename, &EmptyReply {})?)
        }

        Request::List(params) => {
            let resolved = library.resolve(&params.path)?;
            let entries = ops::list(&resolved, params.recursive).await?;
            Ok(message::ok_response(Command::List, &ListReply { entries })?)
        }

        Request::Mkdir(params) => {
            require_file_path(&params.path)?;
            let resolved = library.resolve(&params.path)?;
            ops::mkdir(&resolved).await?;
            Ok(message::ok_response(Command::Mkdir, &EmptyReply {})?)
        }

        Request::Rmdir(params) => {
            require_file_path(&params.path)?;
            let resolved = library.resolve(&params.path)?;
            require_not_root(library, &resolved)?;
            ops::rmdir(&resolved, params.recursive).await?;

            tracing::info!(
                target: "audit",
                session = session.id,
                client = %session.client_label,
                library = %library.id,
                path = %params.path,
                recursive = params.recursive,
                "directory removed"
            );
            Ok(message::ok_response(Command::Rmdir, &EmptyReply {})?)
        }

        Request::Manifest(params) => {
            let resolved = library.resolve(&params.path)?;
            let entries = ops::manifest(&resolved).await?;
            Ok(message::ok_response(
                Command::Manifest,
                &ManifestReply { entries },
            )?)
        }

        Request::Checksum(params) => {
            require_file_path(&params.path)?;
            let resolved = library.resolve(&params.path)?;
            let (size, digest) = ops::checksum(&resolved).await?;
            Ok(message::ok_response(
                Command::Checksum,
                &ChecksumReply { size, digest },
            )?)
        }

        Request::Stat(params) => {
            require_file_path(&params.path)?;
            let resolved = library.resolve(&params.path)?;
            let reply = ops::stat(&resolved).await?;
            Ok(message::ok_response(Command::Stat, &reply)?)
        }

        Request::Exists(params) => {
            let resolved = library.resolve(&params.path)?;
            let exists = ops::exists(&resolved).await;
            Ok(message::ok_response(
                Command::Exists,
                &ExistsReply { exists },
            )?)
        }

        // Both are intercepted by the command loop.
        Request::Handshake(_) | Request::Disconnect => Err(ServerError::Invalid(
            "command handled by the connection loop".into(),
        )),
    }
}

fn require_file_path(path: &str) -> Result<(), ServerError> {
    if path.is_empty() {
        return Err(ServerError::Invalid("path must be nonempty".into()));
    }
    Ok(())
}

fn require_not_root(library: &Library, resolved: &std::path::Path) -> Result<(), ServerError> {
    if resolved == library.root {
        return Err(ServerError::Invalid(
            "path resolves to the library root".into(),
        ));
    }
    Ok(())
}

fn require_hex_digest(digest: &str) -> Result<(), ServerError> {
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ServerError::Invalid(
            "digest must be hex SHA-256 (64 chars)".into(),
        ));
    }
    Ok(())
}

fn require_unlocked(
    ctx: &Arc<ServerContext>,
    library: &Library,
    path: &std::path::Path,
) -> Result<(), ServerError> {
    if ctx.registry.locks.is_locked(&library.id, path) {
        return Err(ServerError::Locked(format!(
            "{} has an active transfer",
            path.display()
        )));
    }
    Ok(())
}
