// crates/db/src/sessions.rs
//! Session lifecycle: create, load, delete, workspace fanout, and cleanup of
//! temporary sessions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use angel_core::session_id::SessionId;

use crate::error::{StoreError, StoreResult};
use crate::handle::{SessionExec, SessionHandle};
use crate::pool::AcquireOpts;
use crate::schema::apply_session_schema;
use crate::Store;

/// Sentinel in the SQLite header's `application_id` (4 bytes big-endian at
/// file offset 68) marking an archived session.
pub const APPLICATION_ID_ARCHIVED: u32 = 0x414E_474C;

/// Read the `application_id` directly from the file header, without opening
/// the database. A file too short to carry a header reads as 0.
pub fn read_application_id(path: &Path) -> std::io::Result<u32> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = std::fs::File::open(path)?;
    if file.metadata()?.len() < 72 {
        return Ok(0);
    }
    file.seek(SeekFrom::Start(68))?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn is_archived(path: &Path) -> std::io::Result<bool> {
    Ok(read_application_id(path)? == APPLICATION_ID_ARCHIVED)
}

/// Mark or unmark the session file behind a leased handle as archived.
pub fn set_archived(handle: &SessionHandle, archived: bool) -> StoreResult<()> {
    let app_id: u32 = if archived { APPLICATION_ID_ARCHIVED } else { 0 };
    handle.execute_batch(&format!("PRAGMA S.application_id = {app_id}"))
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Store {
    /// The on-disk path for a main session's database file.
    pub fn session_db_path(&self, main_session_id: &str) -> PathBuf {
        self.config()
            .session_dir
            .join(format!("{main_session_id}.db"))
    }

    fn sandbox_path(&self, session_id: &str) -> PathBuf {
        self.config().sandbox_dir.join(session_id)
    }

    /// Create a new main session: catalog row, session DB file with schema
    /// and mirror row, initial branch. Returns a leased handle and the
    /// primary branch id.
    pub async fn create_session(
        &self,
        id: &str,
        system_prompt: &str,
        workspace_id: Option<&str>,
    ) -> StoreResult<(SessionHandle, i64)> {
        let sid = SessionId::parse(id);
        if !sid.is_main() {
            return Err(StoreError::conflict(format!(
                "cannot create sub-session {id} directly"
            )));
        }
        let now = now_ts();

        // Catalog row first, so listings see the session immediately.
        let catalog = self.catalog();
        catalog.transaction(|tx| {
            let exists: Option<String> = tx.query_row_opt(
                "SELECT id FROM sessions WHERE id = ?1",
                params![sid.main],
                |row| row.get(0),
            )?;
            if exists.is_some() {
                return Err(StoreError::conflict(format!("session {id} already exists")));
            }
            tx.execute(
                "INSERT INTO sessions
                     (id, created_at, last_updated_at, system_prompt, name, workspace_id)
                 VALUES (?1, ?2, ?2, ?3, '', ?4)",
                params![sid.main, now, system_prompt, workspace_id],
            )?;
            Ok(())
        })?;

        std::fs::create_dir_all(&self.config().session_dir)?;
        let path = self.session_db_path(&sid.main);
        let lease = self
            .pool()
            .acquire(
                &path,
                &sid.main,
                AcquireOpts {
                    skip_tracked_wait: true,
                },
                &CancellationToken::new(),
            )
            .await?;

        let handle = SessionHandle::new(self.db().clone(), sid.clone(), Some(Arc::new(lease)));
        apply_session_schema(&handle)?;

        let branch_id = handle.transaction(|tx| {
            tx.execute(
                "INSERT INTO S.sessions
                     (id, created_at, last_updated_at, system_prompt, name, workspace_id)
                 VALUES ('', ?1, ?1, ?2, '', ?3)",
                params![now, system_prompt, workspace_id],
            )?;
            let branch_id: i64 = tx.query_one(
                "INSERT INTO S.branches (session_id) VALUES ('') RETURNING id",
                params![],
                |row| row.get(0),
            )?;
            tx.execute(
                "UPDATE S.sessions SET primary_branch_id = ?1 WHERE id = ''",
                params![branch_id],
            )?;
            tx.execute(
                "UPDATE sessions SET primary_branch_id = ?1 WHERE id = ?2",
                params![branch_id, sid.main],
            )?;
            Ok(branch_id)
        })?;

        // Our own freshly created file: no need to wait for a watcher pass.
        self.watcher().track_new_file(&sid.main);

        info!(session_id = %sid, "created session");
        Ok((handle, branch_id))
    }

    /// Open an existing session (main or sub) and lease its attachment.
    pub async fn with_session(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<SessionHandle> {
        let sid = SessionId::parse(id);

        let catalog = self.catalog();
        let exists: Option<String> = catalog.query_row_opt(
            "SELECT id FROM sessions WHERE id = ?1",
            params![sid.main],
            |row| row.get(0),
        )?;
        if exists.is_none() {
            return Err(StoreError::not_found(format!("session {id}")));
        }

        let path = self.session_db_path(&sid.main);
        if !path.exists() {
            return Err(StoreError::not_found(format!(
                "session file for {id} is missing"
            )));
        }

        let lease = self
            .pool()
            .acquire(&path, &sid.main, AcquireOpts::default(), cancel)
            .await?;
        Ok(SessionHandle::new(
            self.db().clone(),
            sid,
            Some(Arc::new(lease)),
        ))
    }

    /// Delete a main session: force-detach, purge catalog rows for the
    /// session and its sub-sessions in one transaction, unlink the file,
    /// remove the sandbox directory.
    pub async fn delete_session(&self, id: &str) -> StoreResult<()> {
        let sid = SessionId::parse(id);
        let main = sid.main.clone();

        self.pool().force_detach(&main)?;

        let catalog = self.catalog();
        catalog.transaction(|tx| {
            let like = format!("{main}.%");
            let params: &[&dyn rusqlite::ToSql] = &[&main, &like];
            tx.execute(
                "DELETE FROM message_stems WHERE session_id = ?1 OR session_id LIKE ?2",
                params,
            )?;
            tx.execute(
                "DELETE FROM message_trigrams WHERE session_id = ?1 OR session_id LIKE ?2",
                params,
            )?;
            tx.execute(
                "DELETE FROM messages_searchable WHERE session_id = ?1 OR session_id LIKE ?2",
                params,
            )?;
            tx.execute("DELETE FROM sessions WHERE id = ?1 OR id LIKE ?2", params)?;
            Ok(())
        })?;

        match std::fs::remove_file(self.session_db_path(&main)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Err(err) = std::fs::remove_dir_all(self.sandbox_path(&main)) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(session_id = %main, error = %err, "sandbox removal failed");
            }
        }

        self.watcher().forget(&main);
        info!(session_id = %main, "deleted session");
        Ok(())
    }

    /// Delete a workspace and every session in it.
    pub async fn delete_workspace(&self, workspace_id: &str) -> StoreResult<()> {
        let catalog = self.catalog();
        let exists: Option<String> = catalog.query_row_opt(
            "SELECT id FROM workspaces WHERE id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )?;
        if exists.is_none() {
            return Err(StoreError::not_found(format!("workspace {workspace_id}")));
        }

        let session_ids: Vec<String> = catalog.query_rows(
            "SELECT id FROM sessions WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )?;
        let mains: Vec<String> = session_ids
            .iter()
            .map(|id| SessionId::parse(id).main)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        for main in &mains {
            self.pool().force_detach(main)?;
            match std::fs::remove_file(self.session_db_path(main)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(session_id = %main, error = %err, "file removal failed"),
            }
            if let Err(err) = std::fs::remove_dir_all(self.sandbox_path(main)) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(session_id = %main, error = %err, "sandbox removal failed");
                }
            }
            self.watcher().forget(main);
        }

        catalog.transaction(|tx| {
            for main in &mains {
                let like = format!("{main}.%");
                let params: &[&dyn rusqlite::ToSql] = &[main, &like];
                tx.execute(
                    "DELETE FROM message_stems WHERE session_id = ?1 OR session_id LIKE ?2",
                    params,
                )?;
                tx.execute(
                    "DELETE FROM message_trigrams WHERE session_id = ?1 OR session_id LIKE ?2",
                    params,
                )?;
                tx.execute(
                    "DELETE FROM messages_searchable WHERE session_id = ?1 OR session_id LIKE ?2",
                    params,
                )?;
                tx.execute("DELETE FROM sessions WHERE id = ?1 OR id LIKE ?2", params)?;
            }
            tx.execute("DELETE FROM workspaces WHERE id = ?1", params![workspace_id])?;
            Ok(())
        })?;

        info!(workspace_id, sessions = mains.len(), "deleted workspace");
        Ok(())
    }

    /// Delete temporary sessions (`.`-prefixed) idle for longer than
    /// `older_than`. Not transactional across sessions; a failure on one
    /// leaves the rest for the next sweep.
    pub async fn cleanup_old_temporary_sessions(
        &self,
        older_than: Duration,
    ) -> StoreResult<usize> {
        let cutoff = now_ts() - older_than.as_secs() as i64;
        let catalog = self.catalog();
        let candidates: Vec<String> = catalog.query_rows(
            "SELECT id FROM sessions WHERE id LIKE '.%' AND last_updated_at < ?1",
            params![cutoff],
            |row| row.get(0),
        )?;

        let mut deleted = 0;
        for id in candidates {
            if !SessionId::parse(&id).is_main() {
                continue;
            }
            match self.delete_session(&id).await {
                Ok(()) => deleted += 1,
                Err(err) => warn!(session_id = %id, error = %err, "temp cleanup failed"),
            }
        }
        if deleted > 0 {
            info!(deleted, "cleaned up temporary sessions");
        }
        Ok(deleted)
    }
}

/// Rename a session, updating the authoritative row and the catalog mirror
/// in one transaction. Feeds the `N` stream event upstream.
pub fn rename_session(handle: &SessionHandle, name: &str) -> StoreResult<()> {
    let now = now_ts();
    handle.transaction(|tx| {
        let n = tx.execute(
            "UPDATE S.sessions SET name = ?1, last_updated_at = ?2 WHERE id = ?3",
            params![name, now, tx.id().local],
        )?;
        if n == 0 {
            return Err(StoreError::not_found(format!("session {}", tx.id())));
        }
        tx.execute(
            "UPDATE sessions SET name = ?1, last_updated_at = ?2 WHERE id = ?3",
            params![name, now, tx.id().to_wire()],
        )?;
        Ok(())
    })
}

/// The authoritative session row behind a leased handle.
pub fn session_meta(handle: &SessionHandle) -> StoreResult<angel_types::SessionMeta> {
    let wire = handle.session_id().to_wire();
    handle.query_one(
        "SELECT created_at, last_updated_at, system_prompt, name, workspace_id,
                primary_branch_id, chosen_first_id
           FROM S.sessions WHERE id = ?1",
        params![handle.local_id()],
        |row| {
            Ok(angel_types::SessionMeta {
                id: wire.clone(),
                created_at: row.get(0)?,
                last_updated_at: row.get(1)?,
                system_prompt: row.get(2)?,
                name: row.get(3)?,
                workspace_id: row.get(4)?,
                primary_branch_id: row.get(5)?,
                chosen_first_id: row.get(6)?,
            })
        },
    )
}

/// Create the mirror row for a sub-session inside an existing session DB.
pub fn create_sub_session(
    handle: &SessionHandle,
    system_prompt: &str,
) -> StoreResult<i64> {
    let now = now_ts();
    handle.transaction(|tx| {
        let exists: Option<String> = tx.query_row_opt(
            "SELECT id FROM S.sessions WHERE id = ?1",
            params![tx.id().local],
            |row| row.get(0),
        )?;
        if exists.is_some() {
            return Err(StoreError::conflict(format!(
                "sub-session {} already exists",
                tx.id()
            )));
        }
        tx.execute(
            "INSERT INTO S.sessions (id, created_at, last_updated_at, system_prompt, name)
             VALUES (?1, ?2, ?2, ?3, '')",
            params![tx.id().local, now, system_prompt],
        )?;
        let branch_id: i64 = tx.query_one(
            "INSERT INTO S.branches (session_id) VALUES (?1) RETURNING id",
            params![tx.id().local],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE S.sessions SET primary_branch_id = ?1 WHERE id = ?2",
            params![branch_id, tx.id().local],
        )?;
        Ok(branch_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn application_id_reads_zero_for_short_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.db");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"tiny")
            .unwrap();
        assert_eq!(read_application_id(&path).unwrap(), 0);
        assert!(!is_archived(&path).unwrap());
    }

    #[test]
    fn application_id_reads_big_endian_at_offset_68() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tagged.db");
        let mut contents = vec![0u8; 100];
        contents[68..72].copy_from_slice(&APPLICATION_ID_ARCHIVED.to_be_bytes());
        std::fs::write(&path, &contents).unwrap();
        assert_eq!(read_application_id(&path).unwrap(), APPLICATION_ID_ARCHIVED);
        assert!(is_archived(&path).unwrap());
    }
}
