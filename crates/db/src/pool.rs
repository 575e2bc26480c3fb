// crates/db/src/pool.rs
//! Bounded LRU pool of ATTACHed session databases.
//!
//! SQLite caps concurrent attachments per connection (typically 10). The pool
//! multiplexes demand across that cap: acquire returns a refcounted lease on
//! the alias `session:<mainSessionID>`, release never detaches (eviction is
//! lazy), and waiters queue FIFO when every slot is held.
//!
//! Lock order: pool inner before the connection mutex. The commit/rollback
//! hooks run while the connection is held, so they only touch the leaf-level
//! active set and the watcher's per-file state — never the pool inner lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::handle::Db;
use crate::watcher::WatcherShared;

/// Session id recognized as "no file": acquiring it attaches a fresh
/// in-memory database and skips the tracked wait.
pub const MEMORY_SESSION_ID: &str = ":memory:";

/// The attach alias for a main session.
pub fn alias_for(main_session_id: &str) -> String {
    format!("session:{main_session_id}")
}

fn quote_sql_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOpts {
    /// Skip the wait-until-tracked step; used right after creating a file
    /// ourselves, and by the watcher's own sync attachments.
    pub skip_tracked_wait: bool,
}

#[derive(Debug)]
struct Attached {
    #[allow(dead_code)]
    path: PathBuf,
    main_session_id: String,
    ref_count: usize,
    last_used: Instant,
}

#[derive(Default, Debug)]
struct PoolInner {
    /// alias -> attachment state.
    entries: HashMap<String, Attached>,
    /// Aliases oldest-first; touched on every acquire.
    lru: Vec<String>,
    /// FIFO queue of slot waiters; woken in order on release/eviction.
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// A refcounted right to use one attach alias. Dropping the lease releases
/// the refcount; it never detaches.
pub struct Lease {
    pool: Arc<AttachPool>,
    alias: String,
    main_session_id: String,
}

impl Lease {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn main_session_id(&self) -> &str {
        &self.main_session_id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release(&self.alias);
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("alias", &self.alias).finish()
    }
}

#[derive(Debug)]
pub struct AttachPool {
    db: Db,
    shared: Arc<WatcherShared>,
    max_attached: usize,
    inner: Mutex<PoolInner>,
    /// Main session ids with refcount > 0, readable from inside the commit
    /// hook without taking the pool inner lock.
    active: Arc<Mutex<HashSet<String>>>,
}

impl AttachPool {
    /// Build the pool and install the commit/rollback hooks on the shared
    /// connection. On commit, every actively leased session is marked as an
    /// expected change so the watcher can tell our writes from external ones.
    pub fn new(db: Db, shared: Arc<WatcherShared>, max_attached: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            db: db.clone(),
            shared: shared.clone(),
            max_attached: max_attached.max(1),
            inner: Mutex::new(PoolInner::default()),
            active: Arc::new(Mutex::new(HashSet::new())),
        });

        {
            let active = pool.active.clone();
            let shared_commit = shared.clone();
            let guard = db.lock();
            guard.commit_hook(Some(move || {
                let ids: Vec<String> = {
                    let set = active.lock().unwrap_or_else(|p| p.into_inner());
                    set.iter().cloned().collect()
                };
                for id in ids {
                    shared_commit.mark_expected_change(&id);
                }
                false
            }));

            let active = pool.active.clone();
            let shared_rollback = shared;
            guard.rollback_hook(Some(move || {
                let ids: Vec<String> = {
                    let set = active.lock().unwrap_or_else(|p| p.into_inner());
                    set.iter().cloned().collect()
                };
                for id in ids {
                    shared_rollback.clear_expected_change(&id);
                }
            }));
        }

        pool
    }

    /// Acquire a lease on `path` under the alias for `main_session_id`.
    ///
    /// Blocks (asynchronously) first until the watcher has tracked the file,
    /// then until an attach slot frees up when the pool is full of active
    /// leases. Fails with `Cancelled` when `cancel` fires during either wait.
    pub async fn acquire(
        self: &Arc<Self>,
        path: &Path,
        main_session_id: &str,
        opts: AcquireOpts,
        cancel: &CancellationToken,
    ) -> StoreResult<Lease> {
        if !opts.skip_tracked_wait && main_session_id != MEMORY_SESSION_ID {
            if !self.shared.wait_until_tracked(cancel, main_session_id).await {
                return Err(StoreError::Cancelled);
            }
        }

        let alias = alias_for(main_session_id);
        loop {
            let slot_rx = {
                let mut inner = self.lock_inner();

                // Already attached: share the entry.
                if let Some(entry) = inner.entries.get_mut(&alias) {
                    entry.ref_count += 1;
                    entry.last_used = Instant::now();
                    if entry.ref_count == 1 {
                        self.lock_active().insert(entry.main_session_id.clone());
                    }
                    let pos = inner.lru.iter().position(|a| a == &alias);
                    if let Some(pos) = pos {
                        let a = inner.lru.remove(pos);
                        inner.lru.push(a);
                    }
                    return Ok(self.make_lease(&alias, main_session_id));
                }

                if inner.entries.len() >= self.max_attached {
                    self.try_evict_one(&mut inner);
                }

                if inner.entries.len() < self.max_attached {
                    self.attach_locked(&mut inner, path, main_session_id, &alias)?;
                    return Ok(self.make_lease(&alias, main_session_id));
                }

                // Full of active leases: queue for the next freed slot.
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                rx
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                _ = slot_rx => {}
            }
        }
    }

    /// Detach regardless of refcount. Used before deleting the underlying
    /// file; callers holding stale leases will see their next query fail.
    pub fn force_detach(&self, main_session_id: &str) -> StoreResult<()> {
        let alias = alias_for(main_session_id);
        let mut inner = self.lock_inner();
        if !inner.entries.contains_key(&alias) {
            return Ok(());
        }
        self.db
            .with(|conn| Ok(conn.execute_batch(&format!("DETACH DATABASE \"{alias}\""))?))?;
        inner.entries.remove(&alias);
        inner.lru.retain(|a| a != &alias);
        self.lock_active().remove(main_session_id);
        Self::wake_waiters(&mut inner);
        Ok(())
    }

    /// Detach every zero-refcount entry idle for longer than `older_than`.
    /// Returns the number detached. Errors are logged, never propagated.
    pub fn housekeep(&self, older_than: Duration) -> usize {
        let cutoff = Instant::now() - older_than;
        let mut inner = self.lock_inner();
        let victims: Vec<String> = inner
            .lru
            .iter()
            .filter(|alias| {
                inner
                    .entries
                    .get(*alias)
                    .map(|e| e.ref_count == 0 && e.last_used < cutoff)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let mut detached = 0;
        for alias in victims {
            match self
                .db
                .with(|conn| Ok(conn.execute_batch(&format!("DETACH DATABASE \"{alias}\""))?))
            {
                Ok(()) => {
                    inner.entries.remove(&alias);
                    inner.lru.retain(|a| a != &alias);
                    detached += 1;
                }
                Err(err) => warn!(alias, error = %err, "housekeeping detach failed"),
            }
        }
        if detached > 0 {
            debug!(detached, "housekeeping detached idle sessions");
            Self::wake_waiters(&mut inner);
        }
        detached
    }

    /// Current number of attached databases. Never exceeds the cap.
    pub fn attached_count(&self) -> usize {
        self.lock_inner().entries.len()
    }

    /// `(main_session_id, ref_count)` pairs in LRU order, oldest first.
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        let inner = self.lock_inner();
        inner
            .lru
            .iter()
            .filter_map(|alias| {
                inner
                    .entries
                    .get(alias)
                    .map(|e| (e.main_session_id.clone(), e.ref_count))
            })
            .collect()
    }

    pub(crate) fn release(&self, alias: &str) {
        let mut inner = self.lock_inner();
        let Some(entry) = inner.entries.get_mut(alias) else {
            // Force-detached while the lease was still out.
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        entry.last_used = Instant::now();
        if entry.ref_count == 0 {
            let id = entry.main_session_id.clone();
            self.lock_active().remove(&id);
            Self::wake_waiters(&mut inner);
        }
    }

    fn make_lease(self: &Arc<Self>, alias: &str, main_session_id: &str) -> Lease {
        Lease {
            pool: self.clone(),
            alias: alias.to_string(),
            main_session_id: main_session_id.to_string(),
        }
    }

    /// Attach `path` under `alias` and apply the per-attach pragmas. On
    /// pragma failure the database is detached again and the error surfaced.
    fn attach_locked(
        &self,
        inner: &mut PoolInner,
        path: &Path,
        main_session_id: &str,
        alias: &str,
    ) -> StoreResult<()> {
        let target = if main_session_id == MEMORY_SESSION_ID {
            "':memory:'".to_string()
        } else {
            quote_sql_string(&path.to_string_lossy())
        };

        self.db.with(|conn| {
            conn.execute_batch(&format!("ATTACH DATABASE {target} AS \"{alias}\""))?;

            let pragmas = (|| -> rusqlite::Result<()> {
                // journal_mode returns the resulting mode as a row.
                let _mode: String = conn.query_row(
                    &format!("PRAGMA \"{alias}\".journal_mode = DELETE"),
                    [],
                    |row| row.get(0),
                )?;
                conn.execute_batch(&format!("PRAGMA \"{alias}\".synchronous = FULL"))?;
                Ok(())
            })();

            if let Err(err) = pragmas {
                if let Err(detach_err) =
                    conn.execute_batch(&format!("DETACH DATABASE \"{alias}\""))
                {
                    warn!(alias, error = %detach_err, "detach after pragma failure failed");
                }
                return Err(err.into());
            }
            Ok(())
        })?;

        inner.entries.insert(
            alias.to_string(),
            Attached {
                path: path.to_path_buf(),
                main_session_id: main_session_id.to_string(),
                ref_count: 1,
                last_used: Instant::now(),
            },
        );
        inner.lru.push(alias.to_string());
        self.lock_active().insert(main_session_id.to_string());
        Ok(())
    }

    /// Detach the oldest zero-refcount entry, if any. Detach errors are
    /// logged and treated as "nothing evictable".
    fn try_evict_one(&self, inner: &mut PoolInner) -> bool {
        let victim = inner
            .lru
            .iter()
            .find(|alias| {
                inner
                    .entries
                    .get(*alias)
                    .map(|e| e.ref_count == 0)
                    .unwrap_or(false)
            })
            .cloned();
        let Some(alias) = victim else {
            return false;
        };

        match self
            .db
            .with(|conn| Ok(conn.execute_batch(&format!("DETACH DATABASE \"{alias}\""))?))
        {
            Ok(()) => {
                inner.entries.remove(&alias);
                inner.lru.retain(|a| a != &alias);
                true
            }
            Err(err) => {
                warn!(alias, error = %err, "LRU eviction detach failed");
                false
            }
        }
    }

    fn wake_waiters(inner: &mut PoolInner) {
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_format() {
        assert_eq!(alias_for("AbCdEfGh"), "session:AbCdEfGh");
        assert_eq!(alias_for(".tmpAbCd"), "session:.tmpAbCd");
    }

    #[test]
    fn sql_string_quoting_escapes_quotes() {
        assert_eq!(quote_sql_string("/a/b.db"), "'/a/b.db'");
        assert_eq!(quote_sql_string("it's.db"), "'it''s.db'");
    }
}
