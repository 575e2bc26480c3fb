// crates/db/src/envs.rs
//! Session environments: the generations of exposed directory roots.

use rusqlite::params;

use angel_types::SessionEnv;

use crate::error::{StoreError, StoreResult};
use crate::handle::SessionExec;

/// Set the generation-0 environment. Setting it twice is a conflict.
pub fn set_initial_env<E: SessionExec>(exec: &E, roots: &[String]) -> StoreResult<()> {
    let existing: Option<i64> = exec.query_row_opt(
        "SELECT generation FROM S.session_envs WHERE session_id = ?1 AND generation = 0",
        params![exec.id().local],
        |row| row.get(0),
    )?;
    if existing.is_some() {
        return Err(StoreError::conflict(format!(
            "initial environment for {} already set",
            exec.id()
        )));
    }
    let roots_json = serde_json::to_string(roots)?;
    exec.execute(
        "INSERT INTO S.session_envs (session_id, generation, roots) VALUES (?1, 0, ?2)",
        params![exec.id().local, roots_json],
    )?;
    Ok(())
}

/// Append a new environment generation and return its number. The caller
/// records an `env_changed` message referencing it.
pub fn push_env<E: SessionExec>(exec: &E, roots: &[String]) -> StoreResult<i64> {
    let roots_json = serde_json::to_string(roots)?;
    exec.query_one(
        "INSERT INTO S.session_envs (session_id, generation, roots)
         SELECT ?1, COALESCE(MAX(generation), -1) + 1, ?2
           FROM S.session_envs WHERE session_id = ?1
         RETURNING generation",
        params![exec.id().local, roots_json],
        |row| row.get(0),
    )
}

pub fn env_roots<E: SessionExec>(exec: &E, generation: i64) -> StoreResult<Option<Vec<String>>> {
    let json: Option<String> = exec.query_row_opt(
        "SELECT roots FROM S.session_envs WHERE session_id = ?1 AND generation = ?2",
        params![exec.id().local, generation],
        |row| row.get(0),
    )?;
    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// The most recent environment generation, if any.
pub fn latest_env<E: SessionExec>(exec: &E) -> StoreResult<Option<SessionEnv>> {
    let row: Option<(i64, String)> = exec.query_row_opt(
        "SELECT generation, roots FROM S.session_envs
          WHERE session_id = ?1 ORDER BY generation DESC LIMIT 1",
        params![exec.id().local],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    match row {
        Some((generation, roots_json)) => Ok(Some(SessionEnv {
            session_id: exec.id().to_wire(),
            generation,
            roots: serde_json::from_str(&roots_json)?,
        })),
        None => Ok(None),
    }
}
