//! Live sessions, the lock table, and the idle reaper.
//!
//! Re-architected away from the session/lock/library reference cycle: the
//! lock table is the single owner of lock records, keyed by
//! `(library id, resolved path)`; sessions hold plain key lists, and looking
//! up from a lock to its holder goes through the stored session id.
//!
//! The registry is the only shared mutable state in the server.

use crate::auth::ClientRecord;
use crate::error::ServerError;
use crate::library::Library;
use crate::SessionId;
use dashmap::DashMap;
use harbor_files::UploadStaging;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Compatible with other shared-read locks only
    SharedRead,
    /// Excludes every other lock
    ExclusiveWrite,
}

type LockKey = (String, PathBuf);

#[derive(Debug)]
enum LockEntry {
    Shared(Vec<SessionId>),
    Exclusive(SessionId),
}

/// Keyed lock table with an optional per-library writer slot.
#[derive(Debug, Default)]
pub struct LockTable {
    entries: DashMap<LockKey, LockEntry>,
    // serialize_writes libraries: (owning session, exclusive locks held)
    write_slots: DashMap<String, (SessionId, usize)>,
}

impl LockTable {
    /// Try to acquire a lock. Contention returns the distinct, retryable
    /// `Locked` error immediately.
    ///
    /// # Errors
    ///
    /// `ServerError::Locked` when the path (or, under `serialize_writes`,
    /// the library's writer slot) is held by another session.
    pub fn acquire(
        &self,
        library: &Library,
        path: &Path,
        mode: LockMode,
        session: SessionId,
    ) -> Result<(), ServerError> {
        let key = (library.id.clone(), path.to_path_buf());

        match mode {
            LockMode::SharedRead => match self.entries.entry(key) {
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(LockEntry::Shared(vec![session]));
                    Ok(())
                }
                dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                    match occupied.get_mut() {
                        LockEntry::Shared(holders) => {
                            holders.push(session);
                            Ok(())
                        }
                        LockEntry::Exclusive(owner) => Err(ServerError::Locked(format!(
                            "{} is being written by session {owner}",
                            path.display()
                        ))),
                    }
                }
            },
            LockMode::ExclusiveWrite => {
                if library.serialize_writes {
                    self.claim_write_slot(&library.id, session)?;
                }
                let inserted = match self.entries.entry(key) {
                    dashmap::mapref::entry::Entry::Vacant(vacant) => {
                        vacant.insert(LockEntry::Exclusive(session));
                        true
                    }
                    dashmap::mapref::entry::Entry::Occupied(_) => false,
                };
                if !inserted {
                    if library.serialize_writes {
                        self.release_write_slot(&library.id, session);
                    }
                    return Err(ServerError::Locked(format!(
                        "{} is locked by another session",
                        path.display()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Release one hold on a lock.
    pub fn release(
        &self,
        library_id: &str,
        path: &Path,
        session: SessionId,
        serialize_writes: bool,
    ) {
        let key = (library_id.to_string(), path.to_path_buf());
        let mut released_exclusive = false;

        if let dashmap::mapref::entry::Entry::Occupied(mut occupied) = self.entries.entry(key) {
            let remove = match occupied.get_mut() {
                LockEntry::Shared(holders) => {
                    if let Some(pos) = holders.iter().position(|s| *s == session) {
                        holders.remove(pos);
                    }
                    holders.is_empty()
                }
                LockEntry::Exclusive(owner) if *owner == session => {
                    released_exclusive = true;
                    true
                }
                LockEntry::Exclusive(_) => false,
            };
            if remove {
                occupied.remove();
            }
        }

        if released_exclusive && serialize_writes {
            self.release_write_slot(library_id, session);
        }
    }

    /// Whether any lock is held on the path.
    #[must_use]
    pub fn is_locked(&self, library_id: &str, path: &Path) -> bool {
        self.entries
            .contains_key(&(library_id.to_string(), path.to_path_buf()))
    }

    fn claim_write_slot(&self, library_id: &str, session: SessionId) -> Result<(), ServerError> {
        let mut slot = self
            .write_slots
            .entry(library_id.to_string())
            .or_insert((session, 0));
        if slot.1 > 0 && slot.0 != session {
            return Err(ServerError::Locked(format!(
                "library {library_id} is serializing writes for session {}",
                slot.0
            )));
        }
        slot.0 = session;
        slot.1 += 1;
        Ok(())
    }

    fn release_write_slot(&self, library_id: &str, session: SessionId) {
        let mut remove = false;
        if let Some(mut slot) = self.write_slots.get_mut(library_id) {
            if slot.0 == session {
                slot.1 = slot.1.saturating_sub(1);
                remove = slot.1 == 0;
            }
        }
        if remove {
            self.write_slots
                .remove_if(library_id, |_, (owner, count)| *owner == session && *count == 0);
        }
    }
}

/// Download bookkeeping between `GET_START` and the final `GET_CHUNK`.
#[derive(Debug)]
pub struct DownloadState {
    /// Resolved absolute path
    pub path: PathBuf,
    /// Size advertised at start
    pub size: u64,
    /// Digest advertised at start
    pub digest: String,
}

/// In-flight transfers of one session, keyed by relative path.
#[derive(Debug, Default)]
pub struct Transfers {
    /// Active uploads
    pub uploads: HashMap<String, UploadStaging>,
    /// Active downloads
    pub downloads: HashMap<String, DownloadState>,
}

/// One live session.
#[derive(Debug)]
pub struct Session {
    /// Session id, unique per server lifetime
    pub id: SessionId,
    /// Canonical client identity (certificate fingerprint)
    pub client_fingerprint: String,
    /// Client label for logs
    pub client_label: String,
    /// Library this session is bound to for its lifetime
    pub library_id: String,
    /// Peer address
    pub peer: SocketAddr,
    /// Creation time
    pub created_at: Instant,
    /// Copied from the library at creation
    pub idle_timeout: Duration,
    /// Copied from the library at creation
    pub serialize_writes: bool,
    last_activity: StdMutex<Instant>,
    cancel_tx: watch::Sender<bool>,
    /// In-flight transfer state
    pub transfers: Mutex<Transfers>,
    held_locks: StdMutex<Vec<PathBuf>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Session {
    /// Record activity; consulted by the idle reaper.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    /// Time since the last processed command.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    /// Receiver that flips to `true` when the session is terminated.
    #[must_use]
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Fire the cancellation signal.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Account received content bytes.
    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    /// Account served content bytes.
    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    /// Content bytes moved over this session as (in, out).
    #[must_use]
    pub fn bytes_moved(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }

    fn record_lock(&self, path: &Path) {
        self.held_locks
            .lock()
            .expect("lock list poisoned")
            .push(path.to_path_buf());
    }

    fn forget_lock(&self, path: &Path) {
        let mut held = self.held_locks.lock().expect("lock list poisoned");
        if let Some(pos) = held.iter().position(|p| p == path) {
            held.remove(pos);
        }
    }
}

/// Thread-safe store of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// The lock table
    pub locks: LockTable,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and insert a session; insertion is race-free because the id
    /// comes from an atomic counter.
    pub fn create(
        &self,
        record: &ClientRecord,
        library: &Library,
        peer: SocketAddr,
    ) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, _) = watch::channel(false);

        let session = Arc::new(Session {
            id,
            client_fingerprint: record.fingerprint.clone(),
            client_label: record.label.clone(),
            library_id: library.id.clone(),
            peer,
            created_at: Instant::now(),
            idle_timeout: library.idle_timeout,
            serialize_writes: library.serialize_writes,
            last_activity: StdMutex::new(Instant::now()),
            cancel_tx,
            transfers: Mutex::new(Transfers::default()),
            held_locks: StdMutex::new(Vec::new()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        });

        self.sessions.insert(id, Arc::clone(&session));
        session
    }

    /// Look up a live session.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Acquire a lock on behalf of a session, indexing it for release.
    ///
    /// # Errors
    ///
    /// `ServerError::Locked` on contention.
    pub fn acquire_lock(
        &self,
        session: &Session,
        library: &Library,
        path: &Path,
        mode: LockMode,
    ) -> Result<(), ServerError> {
        self.locks.acquire(library, path, mode, session.id)?;
        session.record_lock(path);
        Ok(())
    }

    /// Release a lock held by a session.
    pub fn release_lock(&self, session: &Session, path: &Path) {
        self.locks
            .release(&session.library_id, path, session.id, session.serialize_writes);
        session.forget_lock(path);
    }

    /// Terminate a session: cancel it, close in-flight transfers, release
    /// its locks, and drop it from the store. Idempotent.
    ///
    /// Upload staging files are left in place so a reconnecting client can
    /// resume; only [`SessionRegistry::reap`] purges them.
    pub async fn remove(&self, id: SessionId) -> bool {
        self.remove_inner(id, false).await
    }

    /// Terminate an idle session the way the reaper does: like
    /// [`SessionRegistry::remove`], but upload staging files are deleted.
    pub async fn reap(&self, id: SessionId) -> bool {
        self.remove_inner(id, true).await
    }

    async fn remove_inner(&self, id: SessionId, purge_staging: bool) -> bool {
        let Some((_, session)) = self.sessions.remove(&id) else {
            return false;
        };
        session.cancel();

        let mut transfers = session.transfers.lock().await;
        for (_, staging) in transfers.uploads.drain() {
            if purge_staging {
                staging.abort().await;
            }
        }
        transfers.downloads.clear();
        drop(transfers);

        let held: Vec<PathBuf> = session
            .held_locks
            .lock()
            .expect("lock list poisoned")
            .drain(..)
            .collect();
        for path in held {
            self.locks.release(
                &session.library_id,
                &path,
                session.id,
                session.serialize_writes,
            );
        }

        tracing::debug!(
            session = id,
            client = %session.client_label,
            library = %session.library_id,
            "session removed"
        );
        true
    }

    /// Terminate every session; used on server shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove(id).await;
        }
    }
}

/// Spawn the idle reaper: every `interval`, sessions idle past their
/// library's timeout are terminated, which deletes their staging files and
/// releases their locks; the connection task observes the cancellation at
/// its next suspension point and closes the transport.
pub fn spawn_reaper(registry: Arc<SessionRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;

            let expired: Vec<(SessionId, String, String)> = registry
                .sessions
                .iter()
                .filter(|entry| entry.value().idle_for() > entry.value().idle_timeout)
                .map(|entry| {
                    let s = entry.value();
                    (s.id, s.client_label.clone(), s.library_id.clone())
                })
                .collect();

            for (id, client, library) in expired {
                tracing::info!(
                    target: "audit",
                    session = id,
                    client = %client,
                    library = %library,
                    "session reaped for idleness"
                );
                registry.reap(id).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn library(id: &str, serialize_writes: bool) -> Library {
        Library {
            id: id.into(),
            name: id.into(),
            root: std::env::temp_dir().canonicalize().unwrap(),
            authorized: HashSet::new(),
            rate_cap: 0,
            idle_timeout: Duration::from_secs(300),
            serialize_writes,
        }
    }

    fn record(label: &str) -> ClientRecord {
        ClientRecord {
            fingerprint: format!("{label}-fp"),
            label: label.into(),
            name: label.into(),
            revoked: false,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn exclusive_excludes_everything() {
        let table = LockTable::default();
        let lib = library("docs", false);
        let path = Path::new("/srv/docs/a.bin");

        table.acquire(&lib, path, LockMode::ExclusiveWrite, 1).unwrap();
        assert!(table
            .acquire(&lib, path, LockMode::ExclusiveWrite, 2)
            .is_err());
        assert!(table.acquire(&lib, path, LockMode::SharedRead, 2).is_err());

        table.release(&lib.id, path, 1, lib.serialize_writes);
        assert!(table
            .acquire(&lib, path, LockMode::ExclusiveWrite, 2)
            .is_ok());
    }

    #[test]
    fn shared_coexists_with_shared() {
        let table = LockTable::default();
        let lib = library("docs", false);
        let path = Path::new("/srv/docs/a.bin");

        table.acquire(&lib, path, LockMode::SharedRead, 1).unwrap();
        table.acquire(&lib, path, LockMode::SharedRead, 2).unwrap();
        assert!(table
            .acquire(&lib, path, LockMode::ExclusiveWrite, 3)
            .is_err());

        table.release(&lib.id, path, 1, false);
        // Still held by session 2.
        assert!(table
            .acquire(&lib, path, LockMode::ExclusiveWrite, 3)
            .is_err());

        table.release(&lib.id, path, 2, false);
        assert!(table
            .acquire(&lib, path, LockMode::ExclusiveWrite, 3)
            .is_ok());
    }

    #[test]
    fn write_slot_serializes_across_paths() {
        let table = LockTable::default();
        let lib = library("docs", true);

        table
            .acquire(&lib, Path::new("/srv/docs/a"), LockMode::ExclusiveWrite, 1)
            .unwrap();
        // A different path, but the library serializes writers.
        assert!(table
            .acquire(&lib, Path::new("/srv/docs/b"), LockMode::ExclusiveWrite, 2)
            .is_err());
        // The owning session may take more write locks.
        table
            .acquire(&lib, Path::new("/srv/docs/b"), LockMode::ExclusiveWrite, 1)
            .unwrap();

        table.release(&lib.id, Path::new("/srv/docs/a"), 1, true);
        assert!(table
            .acquire(&lib, Path::new("/srv/docs/c"), LockMode::ExclusiveWrite, 2)
            .is_err());

        table.release(&lib.id, Path::new("/srv/docs/b"), 1, true);
        assert!(table
            .acquire(&lib, Path::new("/srv/docs/c"), LockMode::ExclusiveWrite, 2)
            .is_ok());
    }

    #[test]
    fn shared_reads_ignore_the_write_slot() {
        let table = LockTable::default();
        let lib = library("docs", true);

        table
            .acquire(&lib, Path::new("/srv/docs/a"), LockMode::ExclusiveWrite, 1)
            .unwrap();
        table
            .acquire(&lib, Path::new("/srv/docs/other"), LockMode::SharedRead, 2)
            .unwrap();
    }

    #[tokio::test]
    async fn registry_creates_unique_ids() {
        let registry = SessionRegistry::new();
        let lib = library("docs", true);

        let a = registry.create(&record("alice"), &lib, peer());
        let b = registry.create(&record("bob"), &lib, peer());
        assert_ne!(a.id, b.id);
        assert_eq!(registry.session_count(), 2);
    }

    #[tokio::test]
    async fn remove_releases_locks_but_keeps_staging() {
        let registry = SessionRegistry::new();
        let lib = library("docs", true);
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("up.bin");

        let session = registry.create(&record("alice"), &lib, peer());
        registry
            .acquire_lock(&session, &lib, &target, LockMode::ExclusiveWrite)
            .unwrap();

        let staging = UploadStaging::open(&target, 8, "00".repeat(32), None)
            .await
            .unwrap();
        let staging_file = harbor_files::staging_path(&target);
        assert!(staging_file.exists());
        session
            .transfers
            .lock()
            .await
            .uploads
            .insert("up.bin".into(), staging);

        assert!(registry.remove(session.id).await);
        // Staging survives a disconnect so the upload can resume.
        assert!(staging_file.exists(), "staging must survive disconnect");
        assert!(!registry.locks.is_locked(&lib.id, &target));
        assert_eq!(registry.session_count(), 0);

        // A second writer can now proceed, write slot included.
        let other = registry.create(&record("bob"), &lib, peer());
        registry
            .acquire_lock(&other, &lib, &target, LockMode::ExclusiveWrite)
            .unwrap();
    }

    #[tokio::test]
    async fn reap_purges_staging() {
        let registry = SessionRegistry::new();
        let lib = library("docs", false);
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("up.bin");

        let session = registry.create(&record("alice"), &lib, peer());
        let staging = UploadStaging::open(&target, 8, "00".repeat(32), None)
            .await
            .unwrap();
        let staging_file = harbor_files::staging_path(&target);
        session
            .transfers
            .lock()
            .await
            .uploads
            .insert("up.bin".into(), staging);

        assert!(registry.reap(session.id).await);
        assert!(!staging_file.exists(), "reaping must purge staging");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let lib = library("docs", false);
        let session = registry.create(&record("alice"), &lib, peer());

        assert!(registry.remove(session.id).await);
        assert!(!registry.remove(session.id).await);
    }

    #[tokio::test]
    async fn cancel_signal_reaches_subscribers() {
        let registry = SessionRegistry::new();
        let lib = library("docs", false);
        let session = registry.create(&record("alice"), &lib, peer());

        let mut cancelled = session.cancelled();
        assert!(!*cancelled.borrow());

        registry.remove(session.id).await;
        cancelled.changed().await.unwrap();
        assert!(*cancelled.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_idle_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let mut lib = library("docs", false);
        lib.idle_timeout = Duration::from_secs(5);

        let session = registry.create(&record("alice"), &lib, peer());
        let reaper = spawn_reaper(Arc::clone(&registry), Duration::from_secs(1));

        // Stays alive while active.
        tokio::time::sleep(Duration::from_secs(3)).await;
        session.touch();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(registry.session_count(), 1);

        // Goes idle past the timeout.
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(registry.session_count(), 0);

        reaper.abort();
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let registry = SessionRegistry::new();
        let lib = library("docs", false);
        registry.create(&record("alice"), &lib, peer());
        registry.create(&record("bob"), &lib, peer());

        registry.shutdown().await;
        assert_eq!(registry.session_count(), 0);
    }
}
