//! Client authentication.
//!
//! The TLS layer already proved the peer holds a certificate chained to the
//! configured CA. This module maps that certificate to a *client record* and
//! applies revocation: the canonical client identity is the lowercase-hex
//! SHA-256 fingerprint of the end-entity certificate in DER form, computed
//! identically at config load and at handshake.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::tls;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// A resolved client record.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Canonical identity: hex SHA-256 of the certificate DER
    pub fingerprint: String,
    /// Label used in library authorization lists
    pub label: String,
    /// Display name
    pub name: String,
    /// Record-level revocation flag
    pub revoked: bool,
}

/// Maps peer certificates to client records and enforces revocation.
pub struct Authenticator {
    records: HashMap<String, ClientRecord>,
    crl: HashSet<String>,
}

/// Lowercase-hex SHA-256 fingerprint of a DER certificate.
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

impl Authenticator {
    /// Build the record set from configuration, computing each client's
    /// fingerprint from its PEM.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` for unreadable certificates or two
    /// clients sharing one certificate.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ServerError> {
        let mut records = HashMap::new();
        for client in &config.clients {
            let certs = tls::load_certs(&client.certificate).map_err(|e| {
                ServerError::Config(format!("client {}: {e}", client.id))
            })?;
            let fp = fingerprint(certs[0].as_ref());
            let record = ClientRecord {
                fingerprint: fp.clone(),
                label: client.id.clone(),
                name: client.name.clone(),
                revoked: client.revoked,
            };
            if records.insert(fp, record).is_some() {
                return Err(ServerError::Config(format!(
                    "client {} reuses another client's certificate",
                    client.id
                )));
            }
        }

        let crl = config
            .security
            .revoked_fingerprints
            .iter()
            .map(|f| f.to_ascii_lowercase())
            .collect();

        Ok(Self { records, crl })
    }

    /// Authenticate a verified peer chain: fingerprint the end-entity
    /// certificate, look up the record, reject revoked or unknown clients.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Auth` with the rejection reason; the reason is
    /// also emitted as an audit event by the caller.
    pub fn authenticate(
        &self,
        peer_certs: &[CertificateDer<'_>],
    ) -> Result<&ClientRecord, ServerError> {
        let end_entity = peer_certs
            .first()
            .ok_or_else(|| ServerError::Auth("peer presented no certificate".into()))?;
        let fp = fingerprint(end_entity.as_ref());

        if self.crl.contains(&fp) {
            return Err(ServerError::Auth(format!(
                "certificate {} is revoked",
                short(&fp)
            )));
        }

        let record = self
            .records
            .get(&fp)
            .ok_or_else(|| ServerError::Auth(format!("unknown certificate {}", short(&fp))))?;

        if record.revoked {
            return Err(ServerError::Auth(format!(
                "client {} is revoked",
                record.label
            )));
        }

        Ok(record)
    }

    /// Fingerprint for a configured client label, used to resolve library
    /// authorization lists at startup.
    #[must_use]
    pub fn fingerprint_for_label(&self, label: &str) -> Option<&str> {
        self.records
            .values()
            .find(|r| r.label == label)
            .map(|r| r.fingerprint.as_str())
    }

    /// Number of known clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.records.len()
    }
}

/// First 12 hex chars, enough to identify a certificate in logs.
pub(crate) fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}
