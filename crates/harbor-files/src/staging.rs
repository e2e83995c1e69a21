//! Upload staging.
//!
//! An in-progress upload writes only to `<target>.partial` beside its final
//! path. Commit verifies the staged digest against the digest advertised at
//! upload start, then atomically renames staging over the target. Until
//! commit, the final path is untouched; abort removes the staging file.
//!
//! Resume falls out of the staging length: re-opening an existing staging
//! file whose length does not exceed the advertised size continues appending
//! from that length.

use crate::error::FilesError;
use crate::hasher;
use crate::ops;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Suffix staged uploads carry beside their final target
pub const STAGING_SUFFIX: &str = ".partial";

/// Staging path for a final target (`a/b.bin` -> `a/b.bin.partial`).
#[must_use]
pub fn staging_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(STAGING_SUFFIX);
    final_path.with_file_name(name)
}

/// An open upload staging file.
#[derive(Debug)]
pub struct UploadStaging {
    final_path: PathBuf,
    staging: PathBuf,
    file: tokio::fs::File,
    committed: u64,
    total_size: u64,
    expected_digest: String,
    mtime: Option<u64>,
}

impl UploadStaging {
    /// Open (or resume) staging for `final_path`.
    ///
    /// Creates missing parent directories. An existing staging file whose
    /// length is at most `total_size` is resumed from that length; a longer
    /// one is stale and is discarded.
    ///
    /// # Errors
    ///
    /// I/O errors creating parents or opening the staging file.
    pub async fn open(
        final_path: &Path,
        total_size: u64,
        expected_digest: String,
        mtime: Option<u64>,
    ) -> Result<Self, FilesError> {
        let staging = staging_path(final_path);

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FilesError::from_io(e, parent))?;
        }

        let committed = match tokio::fs::metadata(&staging).await {
            Ok(meta) if meta.is_file() && meta.len() <= total_size => meta.len(),
            Ok(_) => {
                tokio::fs::remove_file(&staging)
                    .await
                    .map_err(|e| FilesError::from_io(e, &staging))?;
                0
            }
            Err(_) => 0,
        };

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&staging)
            .await
            .map_err(|e| FilesError::from_io(e, &staging))?;

        tracing::debug!(
            target = %final_path.display(),
            committed,
            total_size,
            "upload staging opened"
        );

        Ok(Self {
            final_path: final_path.to_path_buf(),
            staging,
            file,
            committed,
            total_size,
            expected_digest,
            mtime,
        })
    }

    /// Byte offset the uploader must continue from.
    #[must_use]
    pub fn resume_offset(&self) -> u64 {
        self.committed
    }

    /// Final target path.
    #[must_use]
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Append one chunk. The offset must equal the committed length exactly;
    /// a gap or an overlap is rejected, which keeps writes append-only and
    /// resume deterministic.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a misaligned offset or a write past the
    /// advertised size; I/O errors otherwise.
    pub async fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<u64, FilesError> {
        if offset != self.committed {
            return Err(FilesError::InvalidArgument(format!(
                "chunk offset {offset} does not match committed length {}",
                self.committed
            )));
        }
        let end = self
            .committed
            .checked_add(data.len() as u64)
            .filter(|end| *end <= self.total_size)
            .ok_or_else(|| {
                FilesError::InvalidArgument(format!(
                    "chunk would exceed advertised size {}",
                    self.total_size
                ))
            })?;

        self.file
            .write_all(data)
            .await
            .map_err(|e| FilesError::from_io(e, &self.staging))?;
        self.committed = end;
        Ok(self.committed)
    }

    /// Finalize: sync, verify the staged digest against the advertised one,
    /// atomically rename staging over the target, and restore the advertised
    /// mtime if one was supplied. On digest mismatch the staging file is
    /// deleted and nothing reaches the final path.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when fewer than `total_size` bytes were written,
    /// `ChecksumMismatch` on digest disagreement, I/O errors otherwise.
    pub async fn commit(mut self) -> Result<(u64, String), FilesError> {
        if self.committed != self.total_size {
            return Err(FilesError::InvalidArgument(format!(
                "upload incomplete: {} of {} bytes",
                self.committed, self.total_size
            )));
        }

        self.file
            .flush()
            .await
            .map_err(|e| FilesError::from_io(e, &self.staging))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| FilesError::from_io(e, &self.staging))?;
        drop(self.file);

        let (size, computed) = hasher::file_digest(&self.staging)
            .await
            .map_err(|e| FilesError::from_io(e, &self.staging))?;

        if !computed.eq_ignore_ascii_case(&self.expected_digest) {
            let _ = tokio::fs::remove_file(&self.staging).await;
            return Err(FilesError::ChecksumMismatch {
                expected: self.expected_digest,
                computed,
            });
        }

        tokio::fs::rename(&self.staging, &self.final_path)
            .await
            .map_err(|e| FilesError::from_io(e, &self.staging))?;

        if let Some(mtime) = self.mtime {
            if let Err(err) = ops::set_unix_mtime(&self.final_path, mtime) {
                tracing::warn!(
                    path = %self.final_path.display(),
                    %err,
                    "failed to restore mtime"
                );
            }
        }

        Ok((size, computed))
    }

    /// Abandon the upload and remove the staging file.
    pub async fn abort(self) {
        drop(self.file);
        if let Err(err) = tokio::fs::remove_file(&self.staging).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(staging = %self.staging.display(), %err, "failed to remove staging");
            }
        }
    }
}
