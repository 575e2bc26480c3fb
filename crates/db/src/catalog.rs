// crates/db/src/catalog.rs
//! Catalog-side queries: workspaces, session listings, provider configs.

use rusqlite::params;

use angel_types::{SessionMeta, Workspace};

use crate::error::{StoreError, StoreResult};
use crate::handle::SessionExec;
use crate::Store;

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn session_meta_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionMeta> {
    Ok(SessionMeta {
        id: row.get(0)?,
        created_at: row.get(1)?,
        last_updated_at: row.get(2)?,
        system_prompt: row.get(3)?,
        name: row.get(4)?,
        workspace_id: row.get(5)?,
        primary_branch_id: row.get(6)?,
        chosen_first_id: row.get(7)?,
    })
}

const SESSION_META_COLUMNS: &str = "id, created_at, last_updated_at, system_prompt, name, \
     workspace_id, primary_branch_id, chosen_first_id";

impl Store {
    pub fn create_workspace(
        &self,
        name: &str,
        default_system_prompt: &str,
    ) -> StoreResult<Workspace> {
        let id = angel_core::session_id::generate();
        self.catalog().execute(
            "INSERT INTO workspaces (id, name, default_system_prompt) VALUES (?1, ?2, ?3)",
            params![id, name, default_system_prompt],
        )?;
        Ok(Workspace {
            id,
            name: name.to_string(),
            default_system_prompt: default_system_prompt.to_string(),
        })
    }

    pub fn get_workspace(&self, id: &str) -> StoreResult<Workspace> {
        self.catalog()
            .query_row_opt(
                "SELECT id, name, default_system_prompt FROM workspaces WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Workspace {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        default_system_prompt: row.get(2)?,
                    })
                },
            )?
            .ok_or_else(|| StoreError::not_found(format!("workspace {id}")))
    }

    pub fn list_workspaces(&self) -> StoreResult<Vec<Workspace>> {
        self.catalog().query_rows(
            "SELECT id, name, default_system_prompt FROM workspaces ORDER BY name",
            params![],
            |row| {
                Ok(Workspace {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    default_system_prompt: row.get(2)?,
                })
            },
        )
    }

    /// Denormalized session rows, most recently updated first.
    pub fn list_sessions(&self, workspace_id: Option<&str>) -> StoreResult<Vec<SessionMeta>> {
        match workspace_id {
            Some(ws) => self.catalog().query_rows(
                &format!(
                    "SELECT {SESSION_META_COLUMNS} FROM sessions
                      WHERE workspace_id = ?1 ORDER BY last_updated_at DESC"
                ),
                params![ws],
                session_meta_from_row,
            ),
            None => self.catalog().query_rows(
                &format!(
                    "SELECT {SESSION_META_COLUMNS} FROM sessions ORDER BY last_updated_at DESC"
                ),
                params![],
                session_meta_from_row,
            ),
        }
    }

    /// The catalog's denormalized row for a session id (main or sub).
    pub fn get_session_meta(&self, id: &str) -> StoreResult<SessionMeta> {
        self.catalog()
            .query_row_opt(
                &format!("SELECT {SESSION_META_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                session_meta_from_row,
            )?
            .ok_or_else(|| StoreError::not_found(format!("session {id}")))
    }

    pub fn set_provider_config(&self, provider: &str, config_json: &str) -> StoreResult<()> {
        self.catalog().execute(
            "INSERT INTO provider_configs (provider, config) VALUES (?1, ?2)
             ON CONFLICT(provider) DO UPDATE SET config = excluded.config",
            params![provider, config_json],
        )?;
        Ok(())
    }

    pub fn provider_config(&self, provider: &str) -> StoreResult<Option<String>> {
        self.catalog().query_row_opt(
            "SELECT config FROM provider_configs WHERE provider = ?1",
            params![provider],
            |row| row.get(0),
        )
    }

    pub fn set_oauth_token(
        &self,
        provider: &str,
        token: &str,
        expires_at: Option<i64>,
    ) -> StoreResult<()> {
        self.catalog().execute(
            "INSERT INTO oauth_tokens (provider, token, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(provider) DO UPDATE SET
                 token = excluded.token, expires_at = excluded.expires_at",
            params![provider, token, expires_at],
        )?;
        Ok(())
    }

    /// A stored token, dropping it when expired.
    pub fn oauth_token(&self, provider: &str) -> StoreResult<Option<String>> {
        let row: Option<(String, Option<i64>)> = self.catalog().query_row_opt(
            "SELECT token, expires_at FROM oauth_tokens WHERE provider = ?1",
            params![provider],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(match row {
            Some((token, expires_at)) => {
                if expires_at.map(|t| t <= now_ts()).unwrap_or(false) {
                    None
                } else {
                    Some(token)
                }
            }
            None => None,
        })
    }
}
