//! Primitive file operations.
//!
//! Every function receives a pre-resolved absolute path (see
//! [`crate::resolver`]); nothing here re-validates trust. Listings skip
//! in-progress upload staging files.

use crate::error::FilesError;
use crate::hasher;
use crate::staging::STAGING_SUFFIX;
use harbor_proto::message::{DirEntry, EntryKind, ManifestEntry, StatReply};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Seconds since the Unix epoch for a metadata mtime; 0 when unavailable.
#[must_use]
pub fn unix_mtime(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

/// Set a file's mtime to the given epoch seconds.
pub fn set_unix_mtime(path: &Path, secs: u64) -> std::io::Result<()> {
    let time = filetime::FileTime::from_system_time(UNIX_EPOCH + std::time::Duration::from_secs(secs));
    filetime::set_file_mtime(path, time)
}

/// Whether the path exists.
pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Size, mtime, and digest of one path.
///
/// Directories report size 0 and an empty digest.
///
/// # Errors
///
/// `NotFound` when the path is absent; I/O errors otherwise.
pub async fn stat(path: &Path) -> Result<StatReply, FilesError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| FilesError::from_io(e, path))?;

    if meta.is_dir() {
        return Ok(StatReply {
            kind: EntryKind::Dir,
            size: 0,
            mtime: unix_mtime(&meta),
            digest: String::new(),
        });
    }

    let (size, digest) = hasher::file_digest(path)
        .await
        .map_err(|e| FilesError::from_io(e, path))?;
    Ok(StatReply {
        kind: EntryKind::File,
        size,
        mtime: unix_mtime(&meta),
        digest,
    })
}

/// Streamed full-file digest.
///
/// # Errors
///
/// `NotFound` when the path is absent, `NotAFile` for directories.
pub async fn checksum(path: &Path) -> Result<(u64, String), FilesError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| FilesError::from_io(e, path))?;
    if meta.is_dir() {
        return Err(FilesError::NotAFile(path.display().to_string()));
    }
    hasher::file_digest(path)
        .await
        .map_err(|e| FilesError::from_io(e, path))
}

/// Remove a file.
///
/// # Errors
///
/// `NotFound` for a missing path (never a silent success), `NotAFile` for
/// directories.
pub async fn delete(path: &Path) -> Result<(), FilesError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| FilesError::from_io(e, path))?;
    if meta.is_dir() {
        return Err(FilesError::NotAFile(path.display().to_string()));
    }
    tokio::fs::remove_file(path)
        .await
        .map_err(|e| FilesError::from_io(e, path))
}

/// Rename within a library. Atomic where the filesystem provides it.
///
/// # Errors
///
/// `NotFound` when the source is absent, `AlreadyExists` when the target is
/// occupied.
pub async fn rename(from: &Path, to: &Path) -> Result<(), FilesError> {
    if !exists(from).await {
        return Err(FilesError::NotFound(from.display().to_string()));
    }
    if exists(to).await {
        return Err(FilesError::AlreadyExists(to.display().to_string()));
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FilesError::from_io(e, parent))?;
    }
    tokio::fs::rename(from, to)
        .await
        .map_err(|e| FilesError::from_io(e, from))
}

/// Create a directory and any missing parents. Succeeds if it already exists.
///
/// # Errors
///
/// I/O errors, or `AlreadyExists` when a file occupies the path.
pub async fn mkdir(path: &Path) -> Result<(), FilesError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => return Err(FilesError::AlreadyExists(path.display().to_string())),
        Err(_) => {}
    }
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| FilesError::from_io(e, path))
}

/// Remove a directory. With `recursive` false, a non-empty directory fails.
///
/// # Errors
///
/// `NotFound` when absent, `NotADirectory` for files, `NotEmpty` for a
/// populated directory without `recursive`.
pub async fn rmdir(path: &Path, recursive: bool) -> Result<(), FilesError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| FilesError::from_io(e, path))?;
    if !meta.is_dir() {
        return Err(FilesError::NotADirectory(path.display().to_string()));
    }

    if recursive {
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| FilesError::from_io(e, path))
    } else {
        tokio::fs::remove_dir(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::DirectoryNotEmpty => {
                FilesError::NotEmpty(path.display().to_string())
            }
            _ => FilesError::from_io(e, path),
        })
    }
}

/// Enumerate entries beneath `dir`, optionally recursing. Paths in the result
/// are relative to `dir` with forward slashes; staging files are skipped.
/// Symlinked directories are reported but not descended into.
///
/// # Errors
///
/// `NotFound` when `dir` is absent, `NotADirectory` for files.
pub async fn list(dir: &Path, recursive: bool) -> Result<Vec<DirEntry>, FilesError> {
    let meta = tokio::fs::metadata(dir)
        .await
        .map_err(|e| FilesError::from_io(e, dir))?;
    if !meta.is_dir() {
        return Err(FilesError::NotADirectory(dir.display().to_string()));
    }

    let mut entries = Vec::new();
    let mut pending: Vec<PathBuf> = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut reader = tokio::fs::read_dir(&current)
            .await
            .map_err(|e| FilesError::from_io(e, &current))?;
        let mut level = Vec::new();

        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| FilesError::from_io(e, &current))?
        {
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(STAGING_SUFFIX) {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| FilesError::from_io(e, &path))?;

            let rel = relative_display(dir, &path);
            if meta.is_dir() {
                level.push(DirEntry {
                    path: rel,
                    kind: EntryKind::Dir,
                    size: 0,
                    mtime: unix_mtime(&meta),
                });
                if recursive && !meta.file_type().is_symlink() {
                    pending.push(path);
                }
            } else {
                level.push(DirEntry {
                    path: rel,
                    kind: EntryKind::File,
                    size: meta.len(),
                    mtime: unix_mtime(&meta),
                });
            }
        }

        level.sort_by(|a, b| a.path.cmp(&b.path));
        entries.extend(level);
    }

    Ok(entries)
}

/// Recursive listing of files with per-file digests.
///
/// # Errors
///
/// As [`list`], plus I/O errors while hashing.
pub async fn manifest(dir: &Path) -> Result<Vec<ManifestEntry>, FilesError> {
    let listed = list(dir, true).await?;
    let mut entries = Vec::new();

    for item in listed {
        if item.kind != EntryKind::File {
            continue;
        }
        let abs = dir.join(&item.path);
        let (size, digest) = hasher::file_digest(&abs)
            .await
            .map_err(|e| FilesError::from_io(e, &abs))?;
        entries.push(ManifestEntry {
            path: item.path,
            size,
            mtime: item.mtime,
            digest,
        });
    }

    Ok(entries)
}

/// Read up to `max` bytes starting at `offset`. Returns the bytes and
/// whether they reach the end of the file.
///
/// # Errors
///
/// `NotFound` when absent, `NotAFile` for directories, `InvalidArgument`
/// when `offset` is past the end.
pub async fn read_chunk(path: &Path, offset: u64, max: usize) -> Result<(Vec<u8>, bool), FilesError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| FilesError::from_io(e, path))?;
    if meta.is_dir() {
        return Err(FilesError::NotAFile(path.display().to_string()));
    }
    let size = meta.len();
    if offset > size {
        return Err(FilesError::InvalidArgument(format!(
            "offset {offset} past end of file ({size} bytes)"
        )));
    }
    if offset == size {
        return Ok((Vec::new(), true));
    }

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| FilesError::from_io(e, path))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| FilesError::from_io(e, path))?;

    let want = max.min((size - offset) as usize);
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        let n = file
            .read(&mut buf[filled..])
            .await
            .map_err(|e| FilesError::from_io(e, path))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);

    let eof = offset + filled as u64 >= size;
    Ok((buf, eof))
}

fn relative_display(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
