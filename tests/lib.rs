//! Shared harness for FileHarbor integration tests: a throwaway PKI, a
//! server on an ephemeral port, and ready-to-use client configurations.

use harbor_client::ClientConfig;
use harbor_server::config::{
    ClientConfig as ClientRecordConfig, LibraryConfig, LoggingConfig, NetworkConfig,
    SecurityConfig, ServerConfig,
};
use harbor_server::connection::ServerContext;
use harbor_server::runtime::ShutdownHandle;
use harbor_server::Server;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Knobs for one test server.
pub struct EnvOptions {
    /// Library byte/second cap (0 = unbounded)
    pub rate_limit: u64,
    /// Library idle timeout override in seconds
    pub idle_timeout_secs: Option<u64>,
    /// Whether bob appears in the library's authorized set
    pub authorize_bob: bool,
    /// Set the revoked flag on alice's record
    pub revoke_alice: bool,
    /// Put alice's fingerprint in the CRL
    pub crl_alice: bool,
    /// Per-library write serialization
    pub serialize_writes: bool,
    /// Client-side chunk size; small by default so transfers span chunks
    pub chunk_size: u32,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            rate_limit: 0,
            idle_timeout_secs: None,
            authorize_bob: false,
            revoke_alice: false,
            crl_alice: false,
            serialize_writes: true,
            chunk_size: 64 * 1024,
        }
    }
}

/// A running server plus everything a test needs to talk to it.
pub struct TestEnv {
    _dir: TempDir,
    /// Library root on disk
    pub root: PathBuf,
    /// Server address
    pub addr: SocketAddr,
    /// Server internals for assertions (registry, libraries)
    pub ctx: Arc<ServerContext>,
    /// Stops the server
    pub shutdown: ShutdownHandle,
    server: JoinHandle<()>,
    /// Authorized client
    pub alice: ClientConfig,
    /// Second client, unauthorized unless `authorize_bob`
    pub bob: ClientConfig,
}

impl TestEnv {
    /// Stop the server and wait for it to drain.
    pub async fn stop(self) {
        self.shutdown.shutdown();
        let _ = self.server.await;
    }
}

struct Identity {
    cert_path: PathBuf,
    key_path: PathBuf,
}

fn write_identity(
    dir: &Path,
    name: &str,
    sans: Vec<String>,
    eku: ExtendedKeyUsagePurpose,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
) -> Identity {
    let key = KeyPair::generate().expect("keypair");
    let mut params = CertificateParams::new(sans).expect("params");
    params.distinguished_name.push(DnType::CommonName, name);
    params.extended_key_usages = vec![eku];
    let cert = params.signed_by(&key, ca_cert, ca_key).expect("sign");

    let cert_path = dir.join(format!("{name}.pem"));
    let key_path = dir.join(format!("{name}.key"));
    std::fs::write(&cert_path, cert.pem()).expect("write cert");
    std::fs::write(&key_path, key.serialize_pem()).expect("write key");
    Identity {
        cert_path,
        key_path,
    }
}

/// Hex SHA-256 fingerprint of the first certificate in a PEM file, the same
/// derivation the server uses.
pub fn fingerprint_of(cert_path: &Path) -> String {
    let file = std::fs::File::open(cert_path).expect("open cert");
    let der = rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .next()
        .expect("a certificate")
        .expect("valid certificate");
    hex::encode(<sha2::Sha256 as sha2::Digest>::digest(der.as_ref()))
}

/// Generate a PKI, start a server on an ephemeral port, and return the
/// wired-up environment.
pub async fn start_env(options: EnvOptions) -> TestEnv {
    let dir = TempDir::new().expect("tempdir");
    let base = dir.path().to_path_buf();
    let root = base.join("library");
    std::fs::create_dir_all(&root).expect("library root");

    // Certificate authority
    let ca_key = KeyPair::generate().expect("ca keypair");
    let mut ca_params = CertificateParams::new(vec![]).expect("ca params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "harbor test ca");
    let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");
    let ca_path = base.join("ca.pem");
    std::fs::write(&ca_path, ca_cert.pem()).expect("write ca");

    let server_id = write_identity(
        &base,
        "server",
        vec!["localhost".into()],
        ExtendedKeyUsagePurpose::ServerAuth,
        &ca_cert,
        &ca_key,
    );
    let alice_id = write_identity(
        &base,
        "alice",
        vec!["alice".into()],
        ExtendedKeyUsagePurpose::ClientAuth,
        &ca_cert,
        &ca_key,
    );
    let bob_id = write_identity(
        &base,
        "bob",
        vec!["bob".into()],
        ExtendedKeyUsagePurpose::ClientAuth,
        &ca_cert,
        &ca_key,
    );

    let mut authorized = vec!["alice".to_string()];
    if options.authorize_bob {
        authorized.push("bob".to_string());
    }
    let revoked_fingerprints = if options.crl_alice {
        vec![fingerprint_of(&alice_id.cert_path)]
    } else {
        vec![]
    };

    let config = ServerConfig {
        network: NetworkConfig {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 16,
            idle_timeout_secs: 300,
            chunk_size: options.chunk_size,
            read_timeout_secs: 30,
        },
        security: SecurityConfig {
            ca_certificate: ca_path.clone(),
            certificate: server_id.cert_path.clone(),
            private_key: server_id.key_path.clone(),
            ca_private_key: None,
            revoked_fingerprints,
        },
        libraries: vec![LibraryConfig {
            id: "docs".into(),
            name: "Documents".into(),
            root: root.clone(),
            authorized_clients: authorized,
            rate_limit: options.rate_limit,
            idle_timeout_secs: options.idle_timeout_secs,
            serialize_writes: options.serialize_writes,
        }],
        clients: vec![
            ClientRecordConfig {
                id: "alice".into(),
                name: "Alice".into(),
                certificate: alice_id.cert_path.clone(),
                revoked: options.revoke_alice,
            },
            ClientRecordConfig {
                id: "bob".into(),
                name: "Bob".into(),
                certificate: bob_id.cert_path.clone(),
                revoked: false,
            },
        ],
        logging: LoggingConfig::default(),
    };

    let server = Server::bind(config).await.expect("server bind");
    let addr = server.local_addr().expect("local addr");
    let ctx = server.context();
    let shutdown = server.shutdown_handle();
    let server = tokio::spawn(async move {
        if let Err(err) = server.serve().await {
            eprintln!("server error: {err}");
        }
    });

    let client_config = |identity: &Identity| ClientConfig {
        server: harbor_client::config::ServerEndpoint {
            host: "localhost".into(),
            port: addr.port(),
        },
        identity: harbor_client::config::IdentityConfig {
            certificate: identity.cert_path.clone(),
            private_key: identity.key_path.clone(),
            ca_certificate: ca_path.clone(),
        },
        transfer: harbor_client::config::TransferSettings {
            library: "docs".into(),
            chunk_size: options.chunk_size,
            retry_attempts: 3,
            connect_timeout_secs: 5,
        },
    };

    TestEnv {
        alice: client_config(&alice_id),
        bob: client_config(&bob_id),
        _dir: dir,
        root,
        addr,
        ctx,
        shutdown,
        server,
    }
}

/// Open a raw mutually authenticated TLS stream, bypassing the client
/// engine; used for driving the wire protocol by hand.
pub async fn open_tls(
    config: &ClientConfig,
) -> tokio_rustls::client::TlsStream<tokio::net::TcpStream> {
    use rustls::pki_types::ServerName;
    use std::io::BufReader;

    let open = |path: &Path| std::fs::File::open(path).expect("open pem");
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(open(&config.identity.ca_certificate))) {
        roots.add(cert.expect("ca cert")).expect("add ca");
    }
    let certs = rustls_pemfile::certs(&mut BufReader::new(open(&config.identity.certificate)))
        .collect::<Result<Vec<_>, _>>()
        .expect("client certs");
    let key = rustls_pemfile::private_key(&mut BufReader::new(open(&config.identity.private_key)))
        .expect("parse key")
        .expect("a key");

    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .expect("client tls config");

    let tcp = tokio::net::TcpStream::connect((config.server.host.as_str(), config.server.port))
        .await
        .expect("tcp connect");
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls));
    let name = ServerName::try_from(config.server.host.clone()).expect("server name");
    connector.connect(name, tcp).await.expect("tls connect")
}

/// Send one request over a raw stream and decode the typed reply.
pub async fn raw_request<T: serde::de::DeserializeOwned>(
    stream: &mut (impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin),
    request: harbor_proto::Request,
) -> Result<T, harbor_proto::ErrorBody> {
    let frame = request.into_frame().expect("encode request");
    harbor_proto::write_frame(stream, &frame)
        .await
        .expect("write frame");
    let reply = harbor_proto::read_frame(stream).await.expect("read frame");
    harbor_proto::message::decode_reply::<T>(&reply).expect("decode reply")
}

/// Send one request and return the whole reply frame (chunk frames carry a
/// body the typed decoder drops).
pub async fn raw_call(
    stream: &mut (impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin),
    request: harbor_proto::Request,
) -> harbor_proto::Frame {
    let frame = request.into_frame().expect("encode request");
    harbor_proto::write_frame(stream, &frame)
        .await
        .expect("write frame");
    harbor_proto::read_frame(stream).await.expect("read frame")
}

/// Handshake a raw stream into the `docs` library.
pub async fn raw_handshake(
    stream: &mut (impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin),
) -> harbor_proto::message::HandshakeReply {
    raw_request(
        stream,
        harbor_proto::Request::Handshake(harbor_proto::message::HandshakeRequest {
            library_id: "docs".into(),
            protocol_version: harbor_proto::PROTOCOL_VERSION,
        }),
    )
    .await
    .expect("handshake accepted")
}

/// Wait for a condition with a deadline, polling.
pub async fn wait_until<F: Fn() -> bool>(what: &str, deadline: std::time::Duration, check: F) {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}
