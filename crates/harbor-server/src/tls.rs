//! TLS configuration: PEM loading and the mutually authenticated acceptor.

use crate::config::SecurityConfig;
use crate::error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Load every certificate from a PEM file.
///
/// # Errors
///
/// Returns `ServerError::Tls` when the file is unreadable, unparsable, or
/// contains no certificates.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::Tls(format!("cannot open {}: {e}", path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("cannot parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// # Errors
///
/// Returns `ServerError::Tls` when the file is unreadable or holds no key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::Tls(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ServerError::Tls(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| ServerError::Tls(format!("no private key in {}", path.display())))
}

/// Root store holding the configured CA.
///
/// # Errors
///
/// Returns `ServerError::Tls` when the CA file does not load or is rejected.
pub fn ca_root_store(ca_certificate: &Path) -> Result<RootCertStore, ServerError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_certificate)? {
        roots
            .add(cert)
            .map_err(|e| ServerError::Tls(format!("invalid CA certificate: {e}")))?;
    }
    Ok(roots)
}

/// Build the server-side rustls config: present the server chain, demand and
/// verify a client certificate against the configured CA.
///
/// # Errors
///
/// Returns `ServerError::Tls` for unreadable material or rejected
/// combinations.
pub fn server_tls_config(security: &SecurityConfig) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    let roots = ca_root_store(&security.ca_certificate)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ServerError::Tls(format!("client verifier: {e}")))?;

    let certs = load_certs(&security.certificate)?;
    let key = load_private_key(&security.private_key)?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(format!("server certificate: {e}")))?;

    Ok(Arc::new(config))
}
