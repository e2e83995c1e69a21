//! Connection bring-up: mutual TLS, handshake, framed request/response.

use crate::config::ClientConfig;
use crate::error::ClientError;
use harbor_proto::message::{
    self, GetChunkRequest, GetChunkReply, HandshakeReply, HandshakeRequest,
};
use harbor_proto::{
    read_frame, write_frame, Frame, MessageKind, Request, PROTOCOL_VERSION,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// An authenticated session on one TLS connection.
pub struct Connection {
    stream: TlsStream<TcpStream>,
    /// Session id issued at handshake
    pub session_id: u64,
    /// Server's chunk size hint
    pub chunk_size: u32,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::Tls(format!("cannot open {}: {e}", path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| ClientError::Tls(format!("cannot parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ClientError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::Tls(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ClientError::Tls(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| ClientError::Tls(format!("no private key in {}", path.display())))
}

fn tls_connector(config: &ClientConfig) -> Result<TlsConnector, ClientError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&config.identity.ca_certificate)? {
        roots
            .add(cert)
            .map_err(|e| ClientError::Tls(format!("invalid CA certificate: {e}")))?;
    }

    let certs = load_certs(&config.identity.certificate)?;
    let key = load_private_key(&config.identity.private_key)?;

    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| ClientError::Tls(format!("client certificate: {e}")))?;

    Ok(TlsConnector::from(Arc::new(tls)))
}

impl Connection {
    /// Open a TLS connection with mutual authentication and handshake into
    /// the configured library.
    ///
    /// # Errors
    ///
    /// TLS material errors, connect timeouts, transport failures, or a
    /// server-side handshake rejection.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let connector = tls_connector(config)?;
        let addr = format!("{}:{}", config.server.host, config.server.port);

        let tcp = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(config.server.host.clone())
            .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;
        let mut stream = tokio::time::timeout(
            config.connect_timeout(),
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout)??;

        let handshake = Request::Handshake(HandshakeRequest {
            library_id: config.transfer.library.clone(),
            protocol_version: PROTOCOL_VERSION,
        })
        .into_frame()?;
        write_frame(&mut stream, &handshake).await?;

        let reply_frame = read_frame(&mut stream).await?;
        let reply: HandshakeReply = match message::decode_reply(&reply_frame)? {
            Ok(reply) => reply,
            Err(body) => return Err(ClientError::Server(body)),
        };

        tracing::debug!(
            session = reply.session_id,
            chunk_size = reply.chunk_size,
            library = %config.transfer.library,
            "session established"
        );

        Ok(Self {
            stream,
            session_id: reply.session_id,
            chunk_size: reply.chunk_size,
        })
    }

    /// Send one request frame and read its response frame.
    ///
    /// # Errors
    ///
    /// Transport or codec failures.
    pub async fn call(&mut self, request: Request) -> Result<Frame, ClientError> {
        let frame = request.into_frame()?;
        write_frame(&mut self.stream, &frame).await?;
        Ok(read_frame(&mut self.stream).await?)
    }

    /// Send a request and decode the typed reply; server errors become
    /// `ClientError::Server`.
    ///
    /// # Errors
    ///
    /// Transport, codec, or server-reported failures.
    pub async fn request<T: DeserializeOwned>(&mut self, request: Request) -> Result<T, ClientError> {
        let frame = self.call(request).await?;
        match message::decode_reply::<T>(&frame)? {
            Ok(reply) => Ok(reply),
            Err(body) => Err(ClientError::Server(body)),
        }
    }

    /// Fetch one download chunk: typed reply plus body bytes.
    ///
    /// # Errors
    ///
    /// Transport, codec, or server-reported failures; a body length that
    /// disagrees with the reply is a protocol violation.
    pub async fn get_chunk(
        &mut self,
        path: &str,
        offset: u64,
        len: u32,
    ) -> Result<(GetChunkReply, Vec<u8>), ClientError> {
        let frame = self
            .call(Request::GetChunk(GetChunkRequest {
                path: path.to_string(),
                offset,
                len,
            }))
            .await?;

        if frame.kind != MessageKind::Data {
            let reply = message::decode_reply::<GetChunkReply>(&frame)?;
            return match reply {
                Err(body) => Err(ClientError::Server(body)),
                Ok(_) => Err(ClientError::Proto(
                    harbor_proto::ProtoError::UnexpectedFrame {
                        got: frame.command,
                        context: "expecting chunk data",
                    },
                )),
            };
        }

        let reply: GetChunkReply = serde_json::from_slice(&frame.payload)
            .map_err(harbor_proto::ProtoError::Payload)?;
        if reply.len as usize != frame.body.len() {
            return Err(ClientError::Proto(
                harbor_proto::ProtoError::UnexpectedFrame {
                    got: frame.command,
                    context: "body length disagrees with reply",
                },
            ));
        }
        Ok((reply, frame.body))
    }

    /// Round-trip latency via `PING`.
    ///
    /// # Errors
    ///
    /// Transport, codec, or server-reported failures.
    pub async fn ping(&mut self) -> Result<Duration, ClientError> {
        let start = Instant::now();
        let _: message::EmptyReply = self.request(Request::Ping).await?;
        Ok(start.elapsed())
    }

    /// Orderly session end; transport errors are ignored, the connection is
    /// going away either way.
    pub async fn disconnect(mut self) {
        if let Ok(frame) = Request::Disconnect.into_frame() {
            let _ = write_frame(&mut self.stream, &frame).await;
            let _ = read_frame(&mut self.stream).await;
        }
        let _ = self.stream.shutdown().await;
    }
}
