// crates/db/src/lib.rs
//! Split-database storage core.
//!
//! One shared catalog database (`angel.db`) plus one SQLite file per main
//! session. All access funnels through a single writer connection; session
//! DBs are ATTACHed to it on demand through the bounded [`pool::AttachPool`]
//! and kept in sync with the catalog by the [`watcher::SessionWatcher`].

pub mod blobs;
pub mod catalog;
pub mod chain;
pub mod envs;
mod error;
mod handle;
mod migrations;
pub mod pool;
pub mod schema;
pub mod search;
pub mod sessions;
pub mod shell;
pub mod watcher;

pub use chain::{
    append_message, edit_message, get_message, history, last_message_in_branch,
    pending_confirmation, retry_message, set_message_text, set_pending_confirmation,
    set_token_count, switch_primary_branch, Fork, HistoryOptions, HistoryPage, MessageChain,
    NewMessage, LEGACY_FIRST_MESSAGE_ID,
};
pub use error::{StoreError, StoreResult};
pub use handle::{Db, SessionExec, SessionHandle, TxHandle};
pub use pool::{AcquireOpts, AttachPool, Lease};
pub use sessions::{
    is_archived, read_application_id, rename_session, session_meta, set_archived,
    APPLICATION_ID_ARCHIVED,
};
pub use watcher::{SessionWatcher, WatcherShared};

use std::sync::Arc;

use rusqlite::Connection;
use tracing::info;

use angel_core::Config;

/// The storage core: catalog connection, attach pool, session watcher.
pub struct Store {
    db: Db,
    pool: Arc<AttachPool>,
    watcher: Arc<SessionWatcher>,
    config: Config,
}

impl Store {
    /// Open (or create) the catalog and wire up the pool and watcher. The
    /// watcher does not run until [`Store::start_watcher`].
    pub async fn open(config: Config) -> StoreResult<Self> {
        let conn = if config.in_memory {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = config.catalog_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(&config.catalog_path)?
        };

        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        // Durable commits: the watcher's expected-change logic relies on our
        // own writes being on disk when the commit hook fires.
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = DELETE", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = FULL; PRAGMA foreign_keys = ON")?;

        run_migrations(&conn)?;

        let db = Db::new(conn);
        let shared = WatcherShared::new();
        let pool = AttachPool::new(db.clone(), shared.clone(), config.attach_cap);
        let watcher = SessionWatcher::new(
            db.clone(),
            pool.clone(),
            shared,
            config.session_dir.clone(),
            config.watcher_debounce,
            config.poll_interval,
        );

        if !config.in_memory {
            info!(path = %config.catalog_path.display(), "catalog opened");
        }
        Ok(Self {
            db,
            pool,
            watcher,
            config,
        })
    }

    /// Start watching the session directory; runs the startup scan.
    pub async fn start_watcher(&self) -> StoreResult<()> {
        self.watcher.start().await
    }

    /// Stop the watcher (waits up to 1 s) and detach idle attachments.
    pub async fn shutdown(&self) {
        self.watcher.stop().await;
        self.pool.housekeep(std::time::Duration::ZERO);
    }

    pub fn pool(&self) -> &Arc<AttachPool> {
        &self.pool
    }

    pub fn watcher(&self) -> &Arc<SessionWatcher> {
        &self.watcher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A handle targeting only the catalog.
    pub fn catalog(&self) -> SessionHandle {
        SessionHandle::catalog(self.db.clone())
    }

    /// Wipe and rebuild the catalog's searchable-message projection from
    /// whatever session files are on disk.
    pub async fn rebuild_search_index(&self) -> StoreResult<usize> {
        self.watcher.rebuild_search_index().await
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }
}

/// Apply pending catalog migrations, tracked in `_migrations` so that
/// non-idempotent statements execute exactly once.
fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)")?;
    let current: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
            row.get(0)
        })?;

    for (i, migration) in migrations::MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i64;
        if version > current {
            conn.execute_batch(migration)?;
            conn.execute(
                "INSERT INTO _migrations (version) VALUES (?1)",
                rusqlite::params![version],
            )?;
        }
    }
    Ok(())
}
