//! The library set.
//!
//! Libraries are read-only for the server's lifetime: roots are
//! canonicalized and checked at startup, authorization labels are resolved
//! to certificate fingerprints once, and every later lookup is a lock-free
//! read through an `Arc`.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::error::ServerError;
use harbor_files::FilesError;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// One library with its resolved policy.
#[derive(Debug, Clone)]
pub struct Library {
    /// Stable opaque id
    pub id: String,
    /// Human name
    pub name: String,
    /// Canonical absolute root
    pub root: PathBuf,
    /// Authorized client fingerprints
    pub(crate) authorized: HashSet<String>,
    /// Byte/second cap; 0 = unbounded
    pub rate_cap: u64,
    /// Idle timeout for sessions bound here
    pub idle_timeout: Duration,
    /// One writing session at a time when set
    pub serialize_writes: bool,
}

impl Library {
    /// Whether the fingerprint may bind to this library.
    #[must_use]
    pub fn is_authorized(&self, fingerprint: &str) -> bool {
        self.authorized.contains(fingerprint)
    }

    /// Resolve a client-supplied relative path under this library's root.
    ///
    /// # Errors
    ///
    /// `FilesError::Traversal` for anything that would leave the root.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, FilesError> {
        harbor_files::resolve(&self.root, rel)
    }
}

/// Owns the immutable library set.
pub struct LibraryManager {
    libraries: HashMap<String, Library>,
}

impl LibraryManager {
    /// Build the set from configuration: canonicalize roots and resolve
    /// authorization labels through the authenticator.
    ///
    /// # Errors
    ///
    /// `ServerError::Config` for a root that cannot be canonicalized or a
    /// label without a certificate.
    pub fn from_config(
        config: &ServerConfig,
        authenticator: &Authenticator,
    ) -> Result<Self, ServerError> {
        let default_idle = config.idle_timeout();
        let mut libraries = HashMap::new();

        for lib in &config.libraries {
            let root = lib.root.canonicalize().map_err(|e| {
                ServerError::Config(format!(
                    "library {}: cannot canonicalize {}: {e}",
                    lib.id,
                    lib.root.display()
                ))
            })?;

            let mut authorized = HashSet::new();
            for label in &lib.authorized_clients {
                let fp = authenticator.fingerprint_for_label(label).ok_or_else(|| {
                    ServerError::Config(format!(
                        "library {}: no certificate for client {label}",
                        lib.id
                    ))
                })?;
                authorized.insert(fp.to_string());
            }

            tracing::info!(
                library = %lib.id,
                root = %root.display(),
                clients = authorized.len(),
                rate_cap = lib.rate_limit,
                "library registered"
            );

            libraries.insert(
                lib.id.clone(),
                Library {
                    id: lib.id.clone(),
                    name: lib.name.clone(),
                    root,
                    authorized,
                    rate_cap: lib.rate_limit,
                    idle_timeout: lib
                        .idle_timeout_secs
                        .map_or(default_idle, Duration::from_secs),
                    serialize_writes: lib.serialize_writes,
                },
            );
        }

        Ok(Self { libraries })
    }

    /// Look up a library by id.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<&Library> {
        self.libraries.get(id)
    }

    /// Shortest idle timeout across libraries; paces the reaper.
    #[must_use]
    pub fn min_idle_timeout(&self) -> Duration {
        self.libraries
            .values()
            .map(|l| l.idle_timeout)
            .min()
            .unwrap_or(Duration::from_secs(300))
    }

    /// Iterate all libraries.
    pub fn iter(&self) -> impl Iterator<Item = &Library> {
        self.libraries.values()
    }
}
