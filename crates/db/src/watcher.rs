// crates/db/src/watcher.rs
//! Session-directory watcher.
//!
//! Keeps the catalog's denormalized view (sessions rows, searchable-message
//! projection, FTS tables) consistent with whatever is on disk, even when
//! session DB files appear, change, or vanish outside this process.
//!
//! Two scheduling modes:
//! - event mode: native `notify` events, debounced per path (~100 ms) and
//!   handled on the worker task;
//! - polling mode: a 30 s mtime scan over a `known_files` map, entered when
//!   watcher creation fails or the events channel dies.
//!
//! The attach pool's commit hook marks actively leased sessions as expected
//! changes; a debounced write event for an expected change clears the flag
//! and does no DB work, so only external modifications trigger a re-sync.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use angel_core::escape::escape_searchable;
use angel_core::paths;
use angel_core::session_id::SessionId;

use crate::error::StoreResult;
use crate::handle::{Db, SessionExec, SessionHandle};
use crate::pool::{AcquireOpts, AttachPool};
use crate::sessions::{read_application_id, APPLICATION_ID_ARCHIVED};

/// Per-file watcher state, shared with the attach pool.
#[derive(Debug)]
struct FileState {
    tracked: bool,
    expected_change: bool,
    tracked_tx: watch::Sender<bool>,
}

impl FileState {
    fn new() -> Self {
        let (tracked_tx, _) = watch::channel(false);
        Self {
            tracked: false,
            expected_change: false,
            tracked_tx,
        }
    }
}

/// State shared between the watcher worker, the attach pool, and the
/// connection's commit/rollback hooks. All locks here are leaf-level: safe
/// to take from inside the hooks while the connection mutex is held.
#[derive(Debug)]
pub struct WatcherShared {
    files: RwLock<HashMap<String, FileState>>,
    enabled: AtomicBool,
}

impl WatcherShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_tracked(&self, main_id: &str) -> bool {
        self.read()
            .get(main_id)
            .map(|st| st.tracked)
            .unwrap_or(false)
    }

    /// Block until the file for `main_id` becomes tracked. Returns `false`
    /// when `cancel` fires first. Immediately true when no watcher runs.
    pub async fn wait_until_tracked(&self, cancel: &CancellationToken, main_id: &str) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return true;
        }
        loop {
            let mut rx = {
                let mut files = self.write();
                let st = files
                    .entry(main_id.to_string())
                    .or_insert_with(FileState::new);
                if st.tracked {
                    return true;
                }
                st.tracked_tx.subscribe()
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    changed = rx.changed() => match changed {
                        Ok(()) => {
                            if *rx.borrow() {
                                return true;
                            }
                        }
                        // Entry dropped (untracked); resubscribe to a fresh one.
                        Err(_) => break,
                    }
                }
            }
        }
    }

    pub fn mark_tracked(&self, main_id: &str) {
        let mut files = self.write();
        let st = files
            .entry(main_id.to_string())
            .or_insert_with(FileState::new);
        st.tracked = true;
        st.expected_change = false;
        st.tracked_tx.send_replace(true);
    }

    pub fn mark_expected_change(&self, main_id: &str) {
        let mut files = self.write();
        let st = files
            .entry(main_id.to_string())
            .or_insert_with(FileState::new);
        st.expected_change = true;
    }

    pub fn clear_expected_change(&self, main_id: &str) {
        if let Some(st) = self.write().get_mut(main_id) {
            st.expected_change = false;
        }
    }

    /// Clear and return the expected-change flag.
    fn take_expected_change(&self, main_id: &str) -> bool {
        match self.write().get_mut(main_id) {
            Some(st) if st.expected_change => {
                st.expected_change = false;
                true
            }
            _ => false,
        }
    }

    fn remove(&self, main_id: &str) {
        self.write().remove(main_id);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, FileState>> {
        self.files.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, FileState>> {
        self.files.write().unwrap_or_else(|p| p.into_inner())
    }
}

enum WatchMsg {
    Changed(PathBuf),
    /// The native watcher errored; the worker falls back to polling.
    Lost,
}

pub struct SessionWatcher {
    db: Db,
    pool: Arc<AttachPool>,
    shared: Arc<WatcherShared>,
    session_dir: PathBuf,
    debounce: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionWatcher {
    pub fn new(
        db: Db,
        pool: Arc<AttachPool>,
        shared: Arc<WatcherShared>,
        session_dir: PathBuf,
        debounce: Duration,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            pool,
            shared,
            session_dir,
            debounce,
            poll_interval,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn shared(&self) -> &Arc<WatcherShared> {
        &self.shared
    }

    /// Register the native watcher (or fall back to polling) and run the
    /// startup scan. Events emitted during the scan queue behind it on the
    /// worker, so nothing is dropped.
    pub async fn start(self: &Arc<Self>) -> StoreResult<()> {
        std::fs::create_dir_all(&self.session_dir)?;
        self.shared.set_enabled(true);

        let (tx, rx) = mpsc::channel::<WatchMsg>(1024);
        let native = Self::create_native_watcher(&self.session_dir, tx);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.scan_and_track_existing().await;
            match native {
                Some(watcher) => this.event_loop(rx, watcher).await,
                None => this.poll_loop().await,
            }
        });
        *self.worker.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    /// Signal shutdown and wait up to 1 s for the worker to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!("watcher worker did not stop within 1s");
            }
        }
        self.shared.set_enabled(false);
    }

    /// Shortcut used right after our own code created the file: mark it
    /// tracked so acquirers skip the wait.
    pub fn track_new_file(&self, main_id: &str) {
        self.shared.mark_tracked(main_id);
    }

    pub async fn wait_until_tracked(&self, cancel: &CancellationToken, main_id: &str) -> bool {
        self.shared.wait_until_tracked(cancel, main_id).await
    }

    /// Drop the per-file state entry without touching the catalog; used by
    /// the deletion path which purges catalog rows itself.
    pub fn forget(&self, main_id: &str) {
        self.shared.remove(main_id);
    }

    /// Wipe the searchable projection and rebuild it from the session
    /// directory. The denormalization is derived state, so this is always
    /// safe; returns the number of files re-projected.
    pub async fn rebuild_search_index(self: &Arc<Self>) -> StoreResult<usize> {
        let handle = SessionHandle::catalog(self.db.clone());
        handle.transaction(|tx| {
            tx.execute("DELETE FROM messages_searchable", rusqlite::params![])?;
            tx.execute("DELETE FROM message_stems", rusqlite::params![])?;
            tx.execute("DELETE FROM message_trigrams", rusqlite::params![])?;
            Ok(())
        })?;

        let mut rebuilt = 0;
        for (path, _) in self.list_session_files() {
            let Some(main_id) = paths::main_id_from_db_path(&path) else {
                continue;
            };
            self.track_file(&path, &main_id).await;
            rebuilt += 1;
        }
        info!(rebuilt, "rebuilt catalog search projection");
        Ok(rebuilt)
    }

    fn create_native_watcher(
        session_dir: &Path,
        tx: mpsc::Sender<WatchMsg>,
    ) -> Option<RecommendedWatcher> {
        let result = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, notify::EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        if path.extension().map(|e| e == "db").unwrap_or(false) {
                            // Best-effort: a full channel drops the event; the
                            // polling fallback is the safety net for sustained
                            // overload.
                            let _ = tx.try_send(WatchMsg::Changed(path));
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "file watcher error");
                    let _ = tx.try_send(WatchMsg::Lost);
                }
            }
        });

        let mut watcher = match result {
            Ok(w) => w,
            Err(err) => {
                warn!(error = %err, "native watcher unavailable, using polling mode");
                return None;
            }
        };
        if let Err(err) = watcher.watch(session_dir, RecursiveMode::NonRecursive) {
            warn!(error = %err, dir = %session_dir.display(), "watch failed, using polling mode");
            return None;
        }
        info!(dir = %session_dir.display(), "watching session directory");
        Some(watcher)
    }

    /// Event mode: debounce per path, flush due entries, handle each on the
    /// worker. Falls back to polling when the events channel dies.
    async fn event_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<WatchMsg>,
        watcher: RecommendedWatcher,
    ) {
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        loop {
            let next_deadline = pending.values().min().copied();
            let flush_timer = async {
                match next_deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(WatchMsg::Changed(path)) => {
                        pending.insert(path, Instant::now() + self.debounce);
                    }
                    Some(WatchMsg::Lost) | None => {
                        warn!("events channel lost, switching to polling mode");
                        drop(watcher);
                        self.poll_loop().await;
                        return;
                    }
                },
                _ = flush_timer => {
                    let now = Instant::now();
                    let due: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in due {
                        pending.remove(&path);
                        self.handle_path(&path).await;
                    }
                }
            }
        }
        drop(watcher);
    }

    /// Polling mode: compare mtimes against the known-files map.
    async fn poll_loop(self: &Arc<Self>) {
        let mut known: HashMap<PathBuf, SystemTime> = HashMap::new();
        for (path, mtime) in self.list_session_files() {
            known.insert(path, mtime);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let current: HashMap<PathBuf, SystemTime> =
                self.list_session_files().into_iter().collect();

            for (path, mtime) in &current {
                if known.get(path) != Some(mtime) {
                    self.handle_path(path).await;
                }
            }
            let gone: Vec<PathBuf> = known
                .keys()
                .filter(|p| !current.contains_key(*p))
                .cloned()
                .collect();
            for path in gone {
                self.handle_path(&path).await;
            }
            known = current;
        }
    }

    fn list_session_files(&self) -> Vec<(PathBuf, SystemTime)> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.session_dir) {
            Ok(rd) => rd,
            Err(err) => {
                warn!(error = %err, "cannot read session directory");
                return out;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "db").unwrap_or(true) {
                continue;
            }
            if let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) {
                out.push((path, mtime));
            }
        }
        out
    }

    /// Runs once at startup, after the watcher is registered.
    async fn scan_and_track_existing(self: &Arc<Self>) {
        let files = self.list_session_files();
        debug!(count = files.len(), "startup scan of session directory");
        for (path, _) in files {
            self.handle_path(&path).await;
        }
    }

    /// Classify a debounced event by current state rather than event kind:
    /// an untracked write is an implicit create (some platforms skip the
    /// Create event for brand-new files), a missing file is a removal.
    async fn handle_path(self: &Arc<Self>, path: &Path) {
        let Some(main_id) = paths::main_id_from_db_path(path) else {
            return;
        };

        if !path.exists() {
            self.untrack_file(&main_id);
            return;
        }

        if self.shared.is_tracked(&main_id) && self.shared.take_expected_change(&main_id) {
            // Our own write; the catalog is already up to date.
            return;
        }

        self.track_file(path, &main_id).await;
    }

    /// Project the file's sessions and user/model messages into the catalog.
    /// Errors are logged, never propagated; a failed sync leaves the file
    /// untracked so a later event retries.
    async fn track_file(self: &Arc<Self>, path: &Path, main_id: &str) {
        match read_application_id(path) {
            Ok(app_id) if app_id == APPLICATION_ID_ARCHIVED => {
                // Archived sessions stay out of the catalog projection but
                // count as tracked so acquirers don't block.
                self.shared.mark_tracked(main_id);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(main_id, error = %err, "cannot read session file header");
                return;
            }
        }

        let lease = match self
            .pool
            .acquire(
                path,
                main_id,
                AcquireOpts {
                    skip_tracked_wait: true,
                },
                &self.cancel,
            )
            .await
        {
            Ok(lease) => lease,
            Err(err) => {
                warn!(main_id, error = %err, "sync attach failed");
                return;
            }
        };

        let handle = SessionHandle::new(
            self.db.clone(),
            SessionId::parse(main_id),
            Some(Arc::new(lease)),
        );

        if let Err(err) = sync_into_catalog(&handle, main_id) {
            warn!(main_id, error = %err, "catalog sync failed");
            return;
        }

        self.shared.mark_tracked(main_id);
        debug!(main_id, "tracked session file");
    }

    /// Remove all catalog rows for the session and its sub-sessions, then
    /// drop the per-file state entry.
    fn untrack_file(self: &Arc<Self>, main_id: &str) {
        let handle = SessionHandle::catalog(self.db.clone());
        let result = handle.transaction(|tx| {
            let like = format!("{main_id}.%");
            let params: &[&dyn rusqlite::ToSql] = &[&main_id, &like];
            tx.execute(
                "DELETE FROM messages_searchable WHERE session_id = ?1 OR session_id LIKE ?2",
                params,
            )?;
            tx.execute(
                "DELETE FROM message_stems WHERE session_id = ?1 OR session_id LIKE ?2",
                params,
            )?;
            tx.execute(
                "DELETE FROM message_trigrams WHERE session_id = ?1 OR session_id LIKE ?2",
                params,
            )?;
            tx.execute(
                "DELETE FROM sessions WHERE id = ?1 OR id LIKE ?2",
                params,
            )?;
            Ok(())
        });
        if let Err(err) = result {
            warn!(main_id, error = %err, "untrack failed");
            return;
        }
        self.shared.remove(main_id);
        debug!(main_id, "untracked session file");
    }
}

/// One transaction that replaces the catalog's denormalized rows for the
/// session file behind `handle`'s lease.
fn sync_into_catalog(handle: &SessionHandle, main_id: &str) -> StoreResult<()> {
    handle.transaction(|tx| {
        let like = format!("{main_id}.%");

        // Sessions: local empty id maps to the main id, suffixed local ids
        // to `main.<suffix>`.
        struct LocalSession {
            local_id: String,
            created_at: i64,
            last_updated_at: i64,
            system_prompt: String,
            name: String,
            workspace_id: Option<String>,
            primary_branch_id: Option<i64>,
            chosen_first_id: Option<i64>,
        }
        let sessions = tx.query_rows(
            "SELECT id, created_at, last_updated_at, system_prompt, name, workspace_id,
                    primary_branch_id, chosen_first_id
               FROM S.sessions",
            &[],
            |row| {
                Ok(LocalSession {
                    local_id: row.get(0)?,
                    created_at: row.get(1)?,
                    last_updated_at: row.get(2)?,
                    system_prompt: row.get(3)?,
                    name: row.get(4)?,
                    workspace_id: row.get(5)?,
                    primary_branch_id: row.get(6)?,
                    chosen_first_id: row.get(7)?,
                })
            },
        )?;

        for s in &sessions {
            let catalog_id = if s.local_id.is_empty() {
                main_id.to_string()
            } else {
                format!("{main_id}.{}", s.local_id)
            };
            tx.execute(
                "INSERT OR REPLACE INTO sessions
                     (id, created_at, last_updated_at, system_prompt, name, workspace_id,
                      primary_branch_id, chosen_first_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    catalog_id,
                    s.created_at,
                    s.last_updated_at,
                    s.system_prompt,
                    s.name,
                    s.workspace_id,
                    s.primary_branch_id,
                    s.chosen_first_id,
                ],
            )?;
        }

        // Replace the searchable projection wholesale; external modification
        // may have rewritten history arbitrarily.
        let params: &[&dyn rusqlite::ToSql] = &[&main_id, &like];
        tx.execute(
            "DELETE FROM messages_searchable WHERE session_id = ?1 OR session_id LIKE ?2",
            params,
        )?;
        tx.execute(
            "DELETE FROM message_stems WHERE session_id = ?1 OR session_id LIKE ?2",
            params,
        )?;
        tx.execute(
            "DELETE FROM message_trigrams WHERE session_id = ?1 OR session_id LIKE ?2",
            params,
        )?;

        struct SearchableRow {
            local_session_id: String,
            message_id: i64,
            message_type: String,
            text: String,
        }
        let messages = tx.query_rows(
            "SELECT session_id, id, type, text FROM S.messages
              WHERE type IN ('user', 'model') ORDER BY id",
            &[],
            |row| {
                Ok(SearchableRow {
                    local_session_id: row.get(0)?,
                    message_id: row.get(1)?,
                    message_type: row.get(2)?,
                    text: row.get(3)?,
                })
            },
        )?;

        for m in &messages {
            let catalog_id = if m.local_session_id.is_empty() {
                main_id.to_string()
            } else {
                format!("{main_id}.{}", m.local_session_id)
            };
            let escaped = escape_searchable(&m.text);
            tx.execute(
                "INSERT OR REPLACE INTO messages_searchable (session_id, message_id, type, text)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![catalog_id, m.message_id, m.message_type, escaped],
            )?;
            tx.execute(
                "INSERT INTO message_stems (session_id, message_id, text) VALUES (?1, ?2, ?3)",
                rusqlite::params![catalog_id, m.message_id, escaped],
            )?;
            tx.execute(
                "INSERT INTO message_trigrams (session_id, message_id, text) VALUES (?1, ?2, ?3)",
                rusqlite::params![catalog_id, m.message_id, escaped],
            )?;
        }

        Ok(())
    })
}
