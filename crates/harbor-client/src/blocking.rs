//! Blocking front-end.
//!
//! A thin synchronous wrapper over [`HarborClient`]: one engine, two fronts.
//! The wrapper owns a current-thread runtime and drives the async engine to
//! completion per call, so correctness contracts are identical.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::progress::ProgressEvent;
use crate::retry::RetryPolicy;
use crate::transfer::{HarborClient, TransferOutcome};
use harbor_proto::message::{ChecksumReply, DirEntry, ManifestEntry, StatReply};
use std::path::Path;
use std::time::Duration;

/// Synchronous FileHarbor client.
pub struct Client {
    inner: HarborClient,
    runtime: tokio::runtime::Runtime,
}

impl Client {
    /// Build a blocking client and its private runtime.
    ///
    /// # Errors
    ///
    /// Propagates runtime construction failures.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            inner: HarborClient::new(config),
            runtime,
        })
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.inner = self.inner.with_retry_policy(retry);
        self
    }

    /// Install a progress callback.
    #[must_use]
    pub fn on_progress(
        mut self,
        callback: impl Fn(ProgressEvent) + Send + Sync + 'static,
    ) -> Self {
        self.inner = self.inner.on_progress(callback);
        self
    }

    /// See [`HarborClient::upload`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn upload(&self, local: &Path, remote: &str) -> Result<TransferOutcome, ClientError> {
        self.runtime.block_on(self.inner.upload(local, remote))
    }

    /// See [`HarborClient::download`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn download(&self, remote: &str, local: &Path) -> Result<TransferOutcome, ClientError> {
        self.runtime.block_on(self.inner.download(remote, local))
    }

    /// See [`HarborClient::list`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn list(&self, path: &str, recursive: bool) -> Result<Vec<DirEntry>, ClientError> {
        self.runtime.block_on(self.inner.list(path, recursive))
    }

    /// See [`HarborClient::manifest`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn manifest(&self, path: &str) -> Result<Vec<ManifestEntry>, ClientError> {
        self.runtime.block_on(self.inner.manifest(path))
    }

    /// See [`HarborClient::stat`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn stat(&self, path: &str) -> Result<StatReply, ClientError> {
        self.runtime.block_on(self.inner.stat(path))
    }

    /// See [`HarborClient::checksum`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn checksum(&self, path: &str) -> Result<ChecksumReply, ClientError> {
        self.runtime.block_on(self.inner.checksum(path))
    }

    /// See [`HarborClient::exists`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn exists(&self, path: &str) -> Result<bool, ClientError> {
        self.runtime.block_on(self.inner.exists(path))
    }

    /// See [`HarborClient::delete`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn delete(&self, path: &str) -> Result<(), ClientError> {
        self.runtime.block_on(self.inner.delete(path))
    }

    /// See [`HarborClient::rename`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), ClientError> {
        self.runtime.block_on(self.inner.rename(from, to))
    }

    /// See [`HarborClient::mkdir`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn mkdir(&self, path: &str) -> Result<(), ClientError> {
        self.runtime.block_on(self.inner.mkdir(path))
    }

    /// See [`HarborClient::rmdir`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn rmdir(&self, path: &str, recursive: bool) -> Result<(), ClientError> {
        self.runtime.block_on(self.inner.rmdir(path, recursive))
    }

    /// See [`HarborClient::ping`].
    ///
    /// # Errors
    ///
    /// As the async engine.
    pub fn ping(&self) -> Result<Duration, ClientError> {
        self.runtime.block_on(self.inner.ping())
    }
}
