//! Dedup ledger: at most one in-flight worker per key.
//!
//! Pending markers live in a store shared by every relay instance, so any
//! instance can pick up any request. Acquisition is a single atomic
//! "insert if absent" round trip; a separate existence check followed by an
//! insert would let two workers both observe "absent" and both proceed.
//!
//! Markers carry an expiry. A marker stranded by a crashed instance stops
//! blocking its key once the expiry passes. Each marker records the token of
//! its holder and removal only matches that token, so a holder whose marker
//! expired and was taken over cannot delete the new holder's marker.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage backend for pending markers.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Record a marker for `key` unless a live one exists.
    ///
    /// Returns `true` if this call created the marker. Must be atomic with
    /// respect to concurrent callers, including callers in other processes
    /// sharing the same store.
    async fn insert_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Remove the marker for `key` if it is held by `owner`.
    ///
    /// Absent keys and markers held by another owner are left untouched and
    /// are not an error.
    async fn remove(&self, key: &str, owner: &str) -> Result<()>;

    /// Whether a live marker exists for `key`.
    async fn contains(&self, key: &str) -> Result<bool>;
}

/// Identifier recorded as the owner of markers created by this process.
pub fn instance_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A holder token unique within this process, prefixed with `prefix`.
fn next_token(prefix: &str) -> String {
    format!("{}/{}", prefix, NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
}

// ── Guard ───────────────────────────────────────────────────────────

/// Sole mutation path for pending markers.
///
/// [`DedupGuard::try_acquire`] and [`DedupGuard::release`] act under the
/// guard's own token (shared by its clones). Each [`MarkerLease`] holds a
/// token of its own.
#[derive(Clone)]
pub struct DedupGuard {
    store: Arc<dyn DedupStore>,
    owner: String,
    ttl: Duration,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn DedupStore>, ttl: Duration) -> Self {
        Self {
            store,
            owner: next_token(&instance_id()),
            ttl,
        }
    }

    /// Returns `true` and records a marker if none exists for `key`.
    pub async fn try_acquire(&self, key: &str) -> Result<bool> {
        let acquired = self.store.insert_if_absent(key, &self.owner, self.ttl).await?;
        log::debug!("try_acquire({}) -> {}", key, acquired);
        Ok(acquired)
    }

    /// Remove the marker this guard holds for `key`. Idempotent.
    pub async fn release(&self, key: &str) -> Result<()> {
        self.remove_as(key, &self.owner).await
    }

    async fn remove_as(&self, key: &str, owner: &str) -> Result<()> {
        self.store.remove(key, owner).await?;
        log::debug!("released marker for {} ({})", key, owner);
        Ok(())
    }

    pub async fn is_pending(&self, key: &str) -> Result<bool> {
        self.store.contains(key).await
    }

    /// Acquire `key` and bind its release to the returned lease.
    ///
    /// `None` means another worker owns the key.
    pub async fn lease(&self, key: &str) -> Result<Option<MarkerLease>> {
        let token = next_token(&self.owner);
        let acquired = self.store.insert_if_absent(key, &token, self.ttl).await?;
        log::debug!("lease({}) -> {}", key, acquired);
        if !acquired {
            return Ok(None);
        }
        Ok(Some(MarkerLease {
            guard: self.clone(),
            key: key.to_string(),
            token,
            released: false,
        }))
    }
}

/// An acquired marker.
///
/// Call [`MarkerLease::release`] on every normal exit path. If the lease is
/// dropped unreleased (panic, task abort), the release is spawned onto the
/// current Tokio runtime; without a runtime the marker is left to expire.
///
/// Releasing only removes the marker while this lease still holds it.
pub struct MarkerLease {
    guard: DedupGuard,
    key: String,
    token: String,
    released: bool,
}

impl MarkerLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.guard.remove_as(&self.key, &self.token).await
    }
}

impl Drop for MarkerLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let guard = self.guard.clone();
                handle.spawn(async move {
                    if let Err(e) = guard.remove_as(&key, &token).await {
                        log::warn!("Failed to release abandoned marker for {}: {}", key, e);
                    }
                });
            }
            Err(_) => {
                log::warn!("No runtime to release marker for {}; it will expire", key);
            }
        }
    }
}

// ── In-process store ────────────────────────────────────────────────

/// Process-local store. Dedup only covers workers of this process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    markers: Mutex<HashMap<String, MemoryMarker>>,
}

#[derive(Debug)]
struct MemoryMarker {
    owner: String,
    expires_at: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryMarker>> {
        // A poisoned map is still structurally valid
        self.markers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DedupStore for MemoryStore {
    async fn insert_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut markers = self.lock();
        if let Some(marker) = markers.get(key) {
            if marker.expires_at > now {
                return Ok(false);
            }
        }
        markers.insert(
            key.to_string(),
            MemoryMarker {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn remove(&self, key: &str, owner: &str) -> Result<()> {
        let mut markers = self.lock();
        if markers.get(key).is_some_and(|marker| marker.owner == owner) {
            markers.remove(key);
        }
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .lock()
            .get(key)
            .is_some_and(|marker| marker.expires_at > now))
    }
}

// ── SQLite store ────────────────────────────────────────────────────

/// SQLite-backed store shared by every instance that can reach the file.
///
/// Each operation opens its own connection on a blocking thread; no handle
/// is held between operations.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the ledger at `path` and ensure the schema exists.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Self::connect(&path)?;
        // WAL mode lets readers proceed while another instance writes
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pending_markers (
                key         TEXT PRIMARY KEY,
                owner       TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at  INTEGER NOT NULL
            );",
        )?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Self::connect(&path)?;
            op(&conn)
        })
        .await?
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl DedupStore for SqliteStore {
    async fn insert_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let key = key.to_string();
        let owner = owner.to_string();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        self.with_connection(move |conn| {
            let now = now_unix();
            let expires_at = now.saturating_add(ttl_secs);
            // The update branch only fires for an expired marker, so the
            // affected-row count is 1 exactly when this caller took the key.
            let changed = conn.execute(
                "INSERT INTO pending_markers (key, owner, acquired_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(key) DO UPDATE SET \
                    owner = excluded.owner, \
                    acquired_at = excluded.acquired_at, \
                    expires_at = excluded.expires_at \
                 WHERE pending_markers.expires_at <= ?3",
                params![key, owner, now, expires_at],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn remove(&self, key: &str, owner: &str) -> Result<()> {
        let key = key.to_string();
        let owner = owner.to_string();
        self.with_connection(move |conn| {
            conn.execute(
                "DELETE FROM pending_markers WHERE key = ?1 AND owner = ?2",
                params![key, owner],
            )?;
            Ok(())
        })
        .await
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM pending_markers WHERE key = ?1 AND expires_at > ?2",
                    params![key, now_unix()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Barrier;

    const TTL: Duration = Duration::from_secs(60);

    fn sqlite_store(dir: &tempfile::TempDir) -> Arc<SqliteStore> {
        Arc::new(SqliteStore::new(dir.path().join("markers.db")).unwrap())
    }

    async fn assert_acquire_release_cycle(guard: DedupGuard) {
        assert!(guard.try_acquire("Paris").await.unwrap());
        assert!(!guard.try_acquire("Paris").await.unwrap());
        assert!(guard.is_pending("Paris").await.unwrap());

        // Other keys are independent
        assert!(guard.try_acquire("Berlin").await.unwrap());

        guard.release("Paris").await.unwrap();
        assert!(!guard.is_pending("Paris").await.unwrap());
        assert!(guard.try_acquire("Paris").await.unwrap());
    }

    async fn assert_release_is_idempotent(guard: DedupGuard) {
        for _ in 0..3 {
            guard.release("Nowhere").await.unwrap();
        }
        assert!(guard.try_acquire("Nowhere").await.unwrap());
        guard.release("Nowhere").await.unwrap();
        guard.release("Nowhere").await.unwrap();
        assert!(!guard.is_pending("Nowhere").await.unwrap());
    }

    async fn count_concurrent_winners(guard: DedupGuard, contenders: usize) -> usize {
        let barrier = Arc::new(Barrier::new(contenders));
        let mut handles = Vec::new();
        for _ in 0..contenders {
            let guard = guard.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                guard.try_acquire("Paris").await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        winners
    }

    #[tokio::test]
    async fn test_memory_acquire_release_cycle() {
        assert_acquire_release_cycle(DedupGuard::new(Arc::new(MemoryStore::new()), TTL)).await;
    }

    #[tokio::test]
    async fn test_memory_release_is_idempotent() {
        assert_release_is_idempotent(DedupGuard::new(Arc::new(MemoryStore::new()), TTL)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_concurrent_acquirers_single_winner() {
        let guard = DedupGuard::new(Arc::new(MemoryStore::new()), TTL);
        assert_eq!(count_concurrent_winners(guard, 16).await, 1);
    }

    #[tokio::test]
    async fn test_sqlite_acquire_release_cycle() {
        let dir = tempfile::tempdir().unwrap();
        assert_acquire_release_cycle(DedupGuard::new(sqlite_store(&dir), TTL)).await;
    }

    #[tokio::test]
    async fn test_sqlite_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        assert_release_is_idempotent(DedupGuard::new(sqlite_store(&dir), TTL)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sqlite_concurrent_acquirers_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let guard = DedupGuard::new(sqlite_store(&dir), TTL);
        assert_eq!(count_concurrent_winners(guard, 8).await, 1);
    }

    #[tokio::test]
    async fn test_sqlite_markers_are_shared_between_store_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.db");
        let a = DedupGuard::new(Arc::new(SqliteStore::new(&path).unwrap()), TTL);
        let b = DedupGuard::new(Arc::new(SqliteStore::new(&path).unwrap()), TTL);

        assert!(a.try_acquire("Paris").await.unwrap());
        assert!(!b.try_acquire("Paris").await.unwrap());

        // b does not hold the marker, so its release leaves it in place
        b.release("Paris").await.unwrap();
        assert!(b.is_pending("Paris").await.unwrap());

        a.release("Paris").await.unwrap();
        assert!(b.try_acquire("Paris").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_marker_can_be_reacquired() {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = DedupGuard::new(sqlite_store(&dir), Duration::ZERO);
        let memory = DedupGuard::new(Arc::new(MemoryStore::new()), Duration::ZERO);

        for guard in [sqlite, memory] {
            assert!(guard.try_acquire("Paris").await.unwrap());
            assert!(!guard.is_pending("Paris").await.unwrap());
            assert!(guard.try_acquire("Paris").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_lease_releases_explicitly() {
        let guard = DedupGuard::new(Arc::new(MemoryStore::new()), TTL);
        let lease = guard.lease("Paris").await.unwrap().expect("first lease");
        assert_eq!(lease.key(), "Paris");
        assert!(guard.lease("Paris").await.unwrap().is_none());

        lease.release().await.unwrap();
        assert!(!guard.is_pending("Paris").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_marker() {
        let guard = DedupGuard::new(Arc::new(MemoryStore::new()), TTL);
        let lease = guard.lease("Paris").await.unwrap().expect("first lease");
        drop(lease);

        for _ in 0..50 {
            if !guard.is_pending("Paris").await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("marker was not released after lease drop");
    }

    #[tokio::test]
    async fn test_aborted_task_releases_marker() {
        let guard = DedupGuard::new(Arc::new(MemoryStore::new()), TTL);
        let worker_guard = guard.clone();
        let task = tokio::spawn(async move {
            let _lease = worker_guard.lease("Paris").await.unwrap();
            std::future::pending::<()>().await;
        });

        while !guard.is_pending("Paris").await.unwrap() {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;

        for _ in 0..50 {
            if !guard.is_pending("Paris").await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("marker was not released after task abort");
    }

    /// A lease whose marker expired and was taken over must not remove the
    /// new holder's marker when it finally releases.
    async fn assert_stale_release_keeps_new_holder(store: Arc<dyn DedupStore>) {
        let short = DedupGuard::new(store.clone(), Duration::ZERO);
        let long = DedupGuard::new(store, TTL);

        let stale = short.lease("Paris").await.unwrap().expect("first lease");
        let current = long.lease("Paris").await.unwrap().expect("takeover of expired marker");

        stale.release().await.unwrap();
        assert!(long.is_pending("Paris").await.unwrap());
        assert!(long.lease("Paris").await.unwrap().is_none());

        current.release().await.unwrap();
        assert!(!long.is_pending("Paris").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_stale_release_keeps_new_holder() {
        assert_stale_release_keeps_new_holder(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_sqlite_stale_release_keeps_new_holder() {
        let dir = tempfile::tempdir().unwrap();
        assert_stale_release_keeps_new_holder(sqlite_store(&dir)).await;
    }

    #[tokio::test]
    async fn test_dropped_stale_lease_keeps_new_holder() {
        let store: Arc<dyn DedupStore> = Arc::new(MemoryStore::new());
        let short = DedupGuard::new(store.clone(), Duration::ZERO);
        let long = DedupGuard::new(store, TTL);

        let stale = short.lease("Paris").await.unwrap().expect("first lease");
        let _current = long.lease("Paris").await.unwrap().expect("takeover");
        drop(stale);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(long.is_pending("Paris").await.unwrap());
    }

    /// A store that checks and inserts in two steps, with both contenders
    /// forced to finish the check before either inserts.
    struct CheckThenInsertStore {
        inner: MemoryStore,
        between: Barrier,
    }

    #[async_trait]
    impl DedupStore for CheckThenInsertStore {
        async fn insert_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
            let present = self.inner.contains(key).await?;
            self.between.wait().await;
            if present {
                return Ok(false);
            }
            self.inner.insert_if_absent(key, owner, ttl).await?;
            Ok(true)
        }

        async fn remove(&self, key: &str, owner: &str) -> Result<()> {
            self.inner.remove(key, owner).await
        }

        async fn contains(&self, key: &str) -> Result<bool> {
            self.inner.contains(key).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_check_then_insert_admits_two_owners() {
        let store = CheckThenInsertStore {
            inner: MemoryStore::new(),
            between: Barrier::new(2),
        };
        let guard = DedupGuard::new(Arc::new(store), TTL);
        assert_eq!(count_concurrent_winners(guard, 2).await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_atomic_insert_admits_one_owner() {
        let guard = DedupGuard::new(Arc::new(MemoryStore::new()), TTL);
        assert_eq!(count_concurrent_winners(guard, 2).await, 1);
    }
}
