//! Path resolution under a library root.
//!
//! Maps a client-supplied relative path to an absolute path that is provably
//! a descendant of the library root. Rejection is always the distinct
//! path-traversal error, never not-found, so probing reveals nothing about
//! the tree.
//!
//! All file-operation entry points go through [`resolve`]; there is no second
//! code path.

use crate::error::FilesError;
use std::path::{Path, PathBuf};

/// Maximum relative path length in bytes
pub const MAX_PATH_LEN: usize = 1024;

/// Maximum number of path components
pub const MAX_PATH_DEPTH: usize = 32;

/// Names reserved by common platforms, rejected case-insensitively on any
/// component (extension stripped first: `con.txt` is still `CON`).
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Resolve `rel` under `root`.
///
/// `root` must already be canonical (the library manager canonicalizes roots
/// at startup). The empty relative path resolves to the root itself.
///
/// # Errors
///
/// Returns `FilesError::Traversal` when the path is absolute, contains a NUL
/// byte, a `.` or `..` component, a platform-reserved name, exceeds the
/// length or depth limits, or escapes the root through a symlink.
pub fn resolve(root: &Path, rel: &str) -> Result<PathBuf, FilesError> {
    if rel.is_empty() {
        return Ok(root.to_path_buf());
    }
    if rel.len() > MAX_PATH_LEN {
        return Err(FilesError::Traversal(format!(
            "path exceeds {MAX_PATH_LEN} bytes"
        )));
    }
    if rel.contains('\0') {
        return Err(FilesError::Traversal("path contains NUL".into()));
    }

    // Backslashes are treated as separators so Windows-style clients cannot
    // smuggle components past the checks below.
    let normalized = rel.replace('\\', "/");
    if normalized.starts_with('/') || Path::new(&normalized).is_absolute() {
        return Err(FilesError::Traversal(format!("absolute path: {rel}")));
    }

    let mut components = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" => continue,
            "." | ".." => {
                return Err(FilesError::Traversal(format!(
                    "forbidden component in {rel}"
                )));
            }
            _ => {
                let base = part.split('.').next().unwrap_or(part);
                if RESERVED_NAMES
                    .iter()
                    .any(|name| base.eq_ignore_ascii_case(name))
                {
                    return Err(FilesError::Traversal(format!("reserved name: {part}")));
                }
                components.push(part);
            }
        }
    }

    if components.is_empty() {
        return Ok(root.to_path_buf());
    }
    if components.len() > MAX_PATH_DEPTH {
        return Err(FilesError::Traversal(format!(
            "path exceeds {MAX_PATH_DEPTH} components"
        )));
    }

    let mut joined = root.to_path_buf();
    for part in &components {
        joined.push(part);
    }

    // Drive prefixes and the like survive `push` as absolute replacements;
    // verify lexically before touching the filesystem.
    if !joined.starts_with(root) {
        return Err(FilesError::Traversal(format!("escapes root: {rel}")));
    }

    ensure_descendant(root, &joined, rel)?;
    Ok(joined)
}

/// Resolve the deepest existing ancestor of `target` and verify it is still
/// under `root`. Catches symlinks that point outside the library.
fn ensure_descendant(root: &Path, target: &Path, rel: &str) -> Result<(), FilesError> {
    let mut probe: &Path = target;
    loop {
        match probe.canonicalize() {
            Ok(real) => {
                if real.starts_with(root) {
                    return Ok(());
                }
                return Err(FilesError::Traversal(format!(
                    "resolves outside the library: {rel}"
                )));
            }
            Err(_) => match probe.parent() {
                Some(parent) if parent.starts_with(root) => probe = parent,
                // Walked up to the root itself; the root is canonical.
                _ => return Ok(()),
            },
        }
    }
}
