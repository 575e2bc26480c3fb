// crates/db/src/handle.rs
//! Session handles and the `S.` query rewriter.
//!
//! Callers hold a [`SessionHandle`] owning both the session identity and the
//! current attach lease. Every SQL string the handle executes is textually
//! rewritten: the `S.` pseudo-schema marker becomes the handle's attach alias
//! (`"session:<id>".`), or is stripped entirely for a bare catalog handle.
//! The marker is a deliberate sentinel — SQL string literals containing `S.`
//! are disallowed by convention.
//!
//! A suffix handle (`with_suffix("xyz")`) targets a sub-session in the same
//! file; it shares the parent's lease and must not close it, which the
//! `Arc<Lease>` sharing guarantees.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, Row, ToSql};

use angel_core::session_id::SessionId;

use crate::error::{StoreError, StoreResult};
use crate::pool::Lease;

/// The single writer connection to the catalog (and everything ATTACHed to
/// it), shared across the pool, the watcher, and all handles.
///
/// The lock is never held across an `.await`; all SQLite work is short and
/// synchronous under it.
#[derive(Clone, Debug)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-query; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.lock();
        f(&guard)
    }
}

/// The capability set shared by direct handles and transactional handles.
///
/// Chain and lifecycle operations are generic over this trait so they run
/// identically inside and outside a transaction.
pub trait SessionExec {
    /// The session identity this executor targets.
    fn id(&self) -> &SessionId;

    /// Rewrite the `S.` marker for this executor's lease state.
    fn rewrite(&self, sql: &str) -> String;

    fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> StoreResult<usize>;

    fn query_row_opt<T>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        map: impl FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Option<T>>;

    fn query_rows<T>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Vec<T>>;

    /// `query_row_opt` that errors with `NotFound` on no row.
    fn query_one<T>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        map: impl FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        self.query_row_opt(sql, params, map)?
            .ok_or_else(|| StoreError::not_found(format!("no row for {}", self.id())))
    }
}

fn rewrite_with_alias(sql: &str, alias: Option<&str>) -> String {
    match alias {
        Some(alias) => sql.replace("S.", &format!("\"{alias}\".")),
        None => sql.replace("S.", ""),
    }
}

fn run_query_row<T>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
    map: impl FnOnce(&Row<'_>) -> rusqlite::Result<T>,
) -> StoreResult<Option<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(map(row)?)),
        None => Ok(None),
    }
}

fn run_query_rows<T>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
    mut map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> StoreResult<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(map(row)?);
    }
    Ok(out)
}

/// A handle on one session (or the bare catalog when `lease` is absent).
#[derive(Debug)]
pub struct SessionHandle {
    db: Db,
    id: SessionId,
    lease: Option<Arc<Lease>>,
}

impl SessionHandle {
    pub(crate) fn new(db: Db, id: SessionId, lease: Option<Arc<Lease>>) -> Self {
        Self { db, id, lease }
    }

    /// A handle targeting only the catalog. `S.` is stripped from queries.
    pub fn catalog(db: Db) -> Self {
        Self {
            db,
            id: SessionId {
                main: String::new(),
                local: String::new(),
            },
            lease: None,
        }
    }

    /// Derive a handle for a sub-session sharing this handle's lease.
    pub fn with_suffix(&self, suffix: &str) -> SessionHandle {
        SessionHandle {
            db: self.db.clone(),
            id: self.id.with_suffix(suffix),
            lease: self.lease.clone(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// The local id used in the session DB's `session_id` columns: `""` for
    /// the main session, the dot-joined suffix otherwise.
    pub fn local_id(&self) -> &str {
        &self.id.local
    }

    pub fn lease(&self) -> Option<&Arc<Lease>> {
        self.lease.as_ref()
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    fn alias(&self) -> Option<&str> {
        self.lease.as_deref().map(Lease::alias)
    }

    /// Execute a multi-statement batch (schema application).
    pub fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        let sql = self.rewrite(sql);
        self.db.with(|conn| Ok(conn.execute_batch(&sql)?))
    }

    /// Run `f` inside a BEGIN IMMEDIATE transaction on the shared connection.
    /// The closure's executor inherits this handle's identity and rewriter.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&TxHandle<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let guard = self.db.lock();
        guard.execute_batch("BEGIN IMMEDIATE")?;
        let tx = TxHandle {
            conn: &guard,
            id: &self.id,
            alias: self.alias().map(|a| a.to_string()),
        };
        match f(&tx) {
            Ok(value) => {
                guard.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = guard.execute_batch("ROLLBACK") {
                    tracing::error!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl SessionExec for SessionHandle {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn rewrite(&self, sql: &str) -> String {
        rewrite_with_alias(sql, self.alias())
    }

    fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> StoreResult<usize> {
        let sql = self.rewrite(sql);
        self.db.with(|conn| Ok(conn.execute(&sql, params)?))
    }

    fn query_row_opt<T>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        map: impl FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Option<T>> {
        let sql = self.rewrite(sql);
        self.db.with(|conn| run_query_row(conn, &sql, params, map))
    }

    fn query_rows<T>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Vec<T>> {
        let sql = self.rewrite(sql);
        self.db.with(|conn| run_query_rows(conn, &sql, params, map))
    }
}

/// Executor used inside [`SessionHandle::transaction`]. Borrows the already
/// locked connection, so nested locking is impossible by construction.
pub struct TxHandle<'a> {
    conn: &'a Connection,
    id: &'a SessionId,
    alias: Option<String>,
}

impl SessionExec for TxHandle<'_> {
    fn id(&self) -> &SessionId {
        self.id
    }

    fn rewrite(&self, sql: &str) -> String {
        rewrite_with_alias(sql, self.alias.as_deref())
    }

    fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> StoreResult<usize> {
        Ok(self.conn.execute(&self.rewrite(sql), params)?)
    }

    fn query_row_opt<T>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        map: impl FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Option<T>> {
        run_query_row(self.conn, &self.rewrite(sql), params, map)
    }

    fn query_rows<T>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Vec<T>> {
        run_query_rows(self.conn, &self.rewrite(sql), params, map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_targets_alias_when_leased() {
        assert_eq!(
            rewrite_with_alias("SELECT * FROM S.messages", Some("session:AbCd")),
            "SELECT * FROM \"session:AbCd\".messages"
        );
    }

    #[test]
    fn rewrite_strips_marker_for_catalog() {
        assert_eq!(
            rewrite_with_alias("DELETE FROM S.sessions WHERE id = ?1", None),
            "DELETE FROM sessions WHERE id = ?1"
        );
    }

    #[test]
    fn rewrite_handles_multiple_occurrences() {
        let sql = "SELECT m.id FROM S.messages m JOIN S.branches b ON b.id = m.branch_id";
        assert_eq!(
            rewrite_with_alias(sql, Some("session:x")),
            "SELECT m.id FROM \"session:x\".messages m JOIN \"session:x\".branches b ON b.id = m.branch_id"
        );
    }

    #[test]
    fn catalog_handle_has_empty_identity() {
        let conn = Connection::open_in_memory().unwrap();
        let handle = SessionHandle::catalog(Db::new(conn));
        assert!(handle.session_id().main.is_empty());
        assert!(handle.lease().is_none());
    }
}
