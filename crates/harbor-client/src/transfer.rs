//! The transfer engine: uploads and downloads with resume, retry, and
//! progress, plus the one-shot management operations.
//!
//! Each retry attempt is a complete operation on a fresh connection; resume
//! offsets come from the server (uploads) or the local `.partial` file
//! (downloads), so interrupted transfers continue instead of starting over.

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::progress::{Operation, ProgressFn, ProgressReporter};
use crate::retry::{with_retry, RetryPolicy};
use harbor_files::{hasher, ops, staging_path};
use harbor_proto::message::{
    ChecksumReply, DirEntry, EmptyReply, ExistsReply, GetStartReply, GetStartRequest, ListReply,
    ListRequest, ManifestEntry, ManifestReply, PathRequest, PutChunkReply, PutChunkRequest,
    PutCommitReply, PutStartReply, PutStartRequest, RenameRequest, RmdirRequest, StatReply,
};
use harbor_proto::{ErrorKind, Request};
use serde::de::DeserializeOwned;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Result of a completed transfer.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Bytes in the file
    pub bytes: u64,
    /// Hex SHA-256 of the file
    pub digest: String,
    /// Wall time including retries
    pub elapsed: Duration,
}

/// The async client engine.
pub struct HarborClient {
    config: ClientConfig,
    retry: RetryPolicy,
    progress: Option<Arc<ProgressFn>>,
}

impl HarborClient {
    /// Build an engine from configuration; the retry attempt count comes
    /// from the config.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let retry = RetryPolicy::with_attempts(config.transfer.retry_attempts);
        Self {
            config,
            retry,
            progress: None,
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Install a progress callback.
    #[must_use]
    pub fn on_progress(
        mut self,
        callback: impl Fn(crate::progress::ProgressEvent) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// The configuration this engine runs with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a fresh authenticated connection.
    ///
    /// # Errors
    ///
    /// TLS, transport, or handshake failures.
    pub async fn connect(&self) -> Result<Connection, ClientError> {
        Connection::connect(&self.config).await
    }

    /// Upload a local file to `remote`, resuming a previous partial upload.
    ///
    /// # Errors
    ///
    /// Permanent errors immediately; transient ones once retries are
    /// exhausted. A server-reported checksum mismatch is permanent, the
    /// bytes would not improve on retry.
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<TransferOutcome, ClientError> {
        let started = Instant::now();
        let meta = tokio::fs::metadata(local).await?;
        if !meta.is_file() {
            return Err(ClientError::Config(format!(
                "{} is not a regular file",
                local.display()
            )));
        }
        let mtime = ops::unix_mtime(&meta);
        let (size, digest) = hasher::file_digest(local).await?;

        with_retry(&self.retry, |attempt| {
            self.upload_once(local, remote, size, &digest, mtime, attempt)
        })
        .await?;

        Ok(TransferOutcome {
            bytes: size,
            digest,
            elapsed: started.elapsed(),
        })
    }

    async fn upload_once(
        &self,
        local: &Path,
        remote: &str,
        size: u64,
        digest: &str,
        mtime: u64,
        attempt: u32,
    ) -> Result<(), ClientError> {
        let mut conn = self.connect().await?;
        let chunk_size = self.effective_chunk_size(&conn);

        let start: PutStartReply = conn
            .request(Request::PutStart(PutStartRequest {
                path: remote.to_string(),
                size,
                digest: digest.to_string(),
                mtime: Some(mtime),
            }))
            .await?;

        let mut offset = start.resume_offset;
        if offset > 0 {
            tracing::debug!(remote, offset, attempt, "resuming upload");
        }

        let mut reporter =
            ProgressReporter::new(Operation::Upload, remote, size, self.progress.clone());
        reporter.update(offset);

        let mut file = tokio::fs::File::open(local).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; chunk_size];

        while offset < size {
            let want = buf.len().min((size - offset) as usize);
            file.read_exact(&mut buf[..want]).await?;

            let reply: PutChunkReply = conn
                .request(Request::PutChunk(
                    PutChunkRequest {
                        path: remote.to_string(),
                        offset,
                    },
                    buf[..want].to_vec(),
                ))
                .await?;
            offset = reply.committed;
            reporter.update(offset);
        }

        let _: PutCommitReply = conn
            .request(Request::PutCommit(PathRequest {
                path: remote.to_string(),
            }))
            .await?;

        reporter.finish(size);
        conn.disconnect().await;
        Ok(())
    }

    /// Download `remote` into `local`, resuming from an existing `.partial`
    /// file. The received bytes are verified against the server's advertised
    /// digest before the file is moved into place.
    ///
    /// # Errors
    ///
    /// As [`HarborClient::upload`]; a local verification failure deletes the
    /// partial file and surfaces the distinguished checksum-mismatch error.
    pub async fn download(
        &self,
        remote: &str,
        local: &Path,
    ) -> Result<TransferOutcome, ClientError> {
        let started = Instant::now();
        let (bytes, digest) =
            with_retry(&self.retry, |_| self.download_once(remote, local)).await?;
        Ok(TransferOutcome {
            bytes,
            digest,
            elapsed: started.elapsed(),
        })
    }

    async fn download_once(
        &self,
        remote: &str,
        local: &Path,
    ) -> Result<(u64, String), ClientError> {
        let mut conn = self.connect().await?;
        let chunk_size = self.effective_chunk_size(&conn) as u32;
        let partial = staging_path(local);

        let resume_offset = match tokio::fs::metadata(&partial).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        };

        let start: GetStartReply = match conn
            .request(Request::GetStart(GetStartRequest {
                path: remote.to_string(),
                offset: resume_offset,
            }))
            .await
        {
            Ok(reply) => reply,
            // A partial longer than the remote file is stale; restart clean.
            Err(ClientError::Server(body))
                if body.kind == ErrorKind::InvalidArgument && resume_offset > 0 =>
            {
                let _ = tokio::fs::remove_file(&partial).await;
                conn.request(Request::GetStart(GetStartRequest {
                    path: remote.to_string(),
                    offset: 0,
                }))
                .await?
            }
            Err(err) => return Err(err),
        };

        let mut offset = start.offset;
        if offset > 0 {
            tracing::debug!(remote, offset, "resuming download");
        }

        if let Some(parent) = local.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = if offset == 0 {
            tokio::fs::File::create(&partial).await?
        } else {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&partial)
                .await?
        };

        let mut reporter = ProgressReporter::new(
            Operation::Download,
            remote,
            start.size,
            self.progress.clone(),
        );
        reporter.update(offset);

        while offset < start.size {
            let (reply, body) = conn.get_chunk(remote, offset, chunk_size).await?;
            file.write_all(&body).await?;
            offset += body.len() as u64;
            reporter.update(offset);
            if reply.eof {
                break;
            }
            if body.is_empty() {
                // A non-final empty chunk would loop forever.
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "empty chunk before end of stream",
                )));
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if offset < start.size {
            // Short stream; transient, the partial file carries the resume.
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended before the advertised size",
            )));
        }

        let (size, computed) = hasher::file_digest(&partial).await?;
        if !computed.eq_ignore_ascii_case(&start.digest) {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(ClientError::ChecksumMismatch {
                path: remote.to_string(),
                expected: start.digest,
                computed,
            });
        }

        tokio::fs::rename(&partial, local).await?;
        if start.mtime > 0 {
            let _ = ops::set_unix_mtime(local, start.mtime);
        }

        reporter.finish(start.size);
        conn.disconnect().await;
        Ok((size, computed))
    }

    /// List a remote directory.
    ///
    /// # Errors
    ///
    /// Server-reported or transport failures after retries.
    pub async fn list(&self, path: &str, recursive: bool) -> Result<Vec<DirEntry>, ClientError> {
        let request = Request::List(ListRequest {
            path: path.to_string(),
            recursive,
        });
        let reply: ListReply = self.roundtrip(request).await?;
        Ok(reply.entries)
    }

    /// Recursive listing with per-file digests.
    ///
    /// # Errors
    ///
    /// Server-reported or transport failures after retries.
    pub async fn manifest(&self, path: &str) -> Result<Vec<ManifestEntry>, ClientError> {
        let request = Request::Manifest(PathRequest {
            path: path.to_string(),
        });
        let reply: ManifestReply = self.roundtrip(request).await?;
        Ok(reply.entries)
    }

    /// Size, mtime, and digest of a remote path.
    ///
    /// # Errors
    ///
    /// Server-reported or transport failures after retries.
    pub async fn stat(&self, path: &str) -> Result<StatReply, ClientError> {
        self.roundtrip(Request::Stat(PathRequest {
            path: path.to_string(),
        }))
        .await
    }

    /// Full-file digest of a remote path.
    ///
    /// # Errors
    ///
    /// Server-reported or transport failures after retries.
    pub async fn checksum(&self, path: &str) -> Result<ChecksumReply, ClientError> {
        self.roundtrip(Request::Checksum(PathRequest {
            path: path.to_string(),
        }))
        .await
    }

    /// Whether a remote path exists.
    ///
    /// # Errors
    ///
    /// Server-reported or transport failures after retries.
    pub async fn exists(&self, path: &str) -> Result<bool, ClientError> {
        let reply: ExistsReply = self
            .roundtrip(Request::Exists(PathRequest {
                path: path.to_string(),
            }))
            .await?;
        Ok(reply.exists)
    }

    /// Delete a remote file.
    ///
    /// # Errors
    ///
    /// Server-reported or transport failures after retries.
    pub async fn delete(&self, path: &str) -> Result<(), ClientError> {
        let _: EmptyReply = self
            .roundtrip(Request::Delete(PathRequest {
                path: path.to_string(),
            }))
            .await?;
        Ok(())
    }

    /// Rename within the library.
    ///
    /// # Errors
    ///
    /// Server-reported or transport failures after retries.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), ClientError> {
        let _: EmptyReply = self
            .roundtrip(Request::Rename(RenameRequest {
                from: from.to_string(),
                to: to.to_string(),
            }))
            .await?;
        Ok(())
    }

    /// Create a remote directory and missing parents.
    ///
    /// # Errors
    ///
    /// Server-reported or transport failures after retries.
    pub async fn mkdir(&self, path: &str) -> Result<(), ClientError> {
        let _: EmptyReply = self
            .roundtrip(Request::Mkdir(PathRequest {
                path: path.to_string(),
            }))
            .await?;
        Ok(())
    }

    /// Remove a remote directory.
    ///
    /// # Errors
    ///
    /// Server-reported or transport failures after retries.
    pub async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), ClientError> {
        let _: EmptyReply = self
            .roundtrip(Request::Rmdir(RmdirRequest {
                path: path.to_string(),
                recursive,
            }))
            .await?;
        Ok(())
    }

    /// Round-trip latency.
    ///
    /// # Errors
    ///
    /// Transport or handshake failures after retries.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        with_retry(&self.retry, |_| async move {
            let mut conn = self.connect().await?;
            let latency = conn.ping().await?;
            conn.disconnect().await;
            Ok(latency)
        })
        .await
    }

    /// One request on a fresh connection, retried per policy.
    async fn roundtrip<T: DeserializeOwned>(&self, request: Request) -> Result<T, ClientError> {
        with_retry(&self.retry, |_| {
            let request = request.clone();
            async move {
                let mut conn = self.connect().await?;
                let result = conn.request::<T>(request).await;
                conn.disconnect().await;
                result
            }
        })
        .await
    }

    /// Chunk size honoring the server's hint and the protocol ceiling.
    fn effective_chunk_size(&self, conn: &Connection) -> usize {
        self.config
            .transfer
            .chunk_size
            .min(conn.chunk_size)
            .min(harbor_proto::MAX_BODY_LEN)
            .max(1) as usize
    }
}
