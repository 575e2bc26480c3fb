// crates/db/src/shell.rs
//! Sandboxed shell command rows and incremental output polling.
//!
//! Output accumulates in the `stdout`/`stderr` blobs while a command runs;
//! clients poll with byte offsets and receive only the new bytes plus the
//! current status.

use rusqlite::params;

use angel_types::{ShellCommand, ShellCommandStatus};

use crate::error::{StoreError, StoreResult};
use crate::handle::SessionExec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn column(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn command_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShellCommand> {
    let status_str: String = row.get(3)?;
    let status = ShellCommandStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown shell status {status_str:?}").into(),
        )
    })?;
    Ok(ShellCommand {
        id: row.get(0)?,
        branch_id: row.get(1)?,
        command: row.get(2)?,
        status,
        exit_code: row.get(4)?,
        started_at: row.get(5)?,
        finished_at: row.get(6)?,
    })
}

const COMMAND_COLUMNS: &str =
    "id, branch_id, command, status, exit_code, started_at, finished_at";

/// Record a command entering the `running` state.
pub fn start_shell_command<E: SessionExec>(
    exec: &E,
    branch_id: i64,
    command: &str,
) -> StoreResult<ShellCommand> {
    let now = now_ts();
    let id: i64 = exec.query_one(
        "INSERT INTO S.shell_commands (session_id, branch_id, command, status, started_at)
         VALUES (?1, ?2, ?3, 'running', ?4) RETURNING id",
        params![exec.id().local, branch_id, command, now],
        |row| row.get(0),
    )?;
    get_shell_command(exec, id)?
        .ok_or_else(|| StoreError::Corrupt(format!("shell command {id} vanished")))
}

pub fn get_shell_command<E: SessionExec>(
    exec: &E,
    id: i64,
) -> StoreResult<Option<ShellCommand>> {
    exec.query_row_opt(
        &format!("SELECT {COMMAND_COLUMNS} FROM S.shell_commands WHERE id = ?1"),
        params![id],
        command_from_row,
    )
}

/// Append a chunk to stdout or stderr.
pub fn append_shell_output<E: SessionExec>(
    exec: &E,
    id: i64,
    stream: OutputStream,
    chunk: &[u8],
) -> StoreResult<()> {
    let col = stream.column();
    let n = exec.execute(
        &format!("UPDATE S.shell_commands SET {col} = {col} || ?1 WHERE id = ?2"),
        params![chunk, id],
    )?;
    if n == 0 {
        return Err(StoreError::not_found(format!("shell command {id}")));
    }
    Ok(())
}

/// Move a running command into a terminal state. Finishing an already
/// finished command is a conflict; the status machine only moves forward.
pub fn finish_shell_command<E: SessionExec>(
    exec: &E,
    id: i64,
    status: ShellCommandStatus,
    exit_code: Option<i64>,
) -> StoreResult<()> {
    if !status.is_terminal() {
        return Err(StoreError::conflict("finish requires a terminal status"));
    }
    let n = exec.execute(
        "UPDATE S.shell_commands SET status = ?1, exit_code = ?2, finished_at = ?3
          WHERE id = ?4 AND status = 'running'",
        params![status.as_str(), exit_code, now_ts(), id],
    )?;
    if n == 0 {
        let current = get_shell_command(exec, id)?;
        return match current {
            None => Err(StoreError::not_found(format!("shell command {id}"))),
            Some(cmd) => Err(StoreError::conflict(format!(
                "shell command {id} already {}",
                cmd.status.as_str()
            ))),
        };
    }
    Ok(())
}

/// Bytes past the caller's offsets, plus the authoritative totals.
#[derive(Debug)]
pub struct ShellOutput {
    pub command: ShellCommand,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_len: u64,
    pub stderr_len: u64,
}

/// Incremental poll: returns output beyond `stdout_offset`/`stderr_offset`.
pub fn poll_shell_output<E: SessionExec>(
    exec: &E,
    id: i64,
    stdout_offset: u64,
    stderr_offset: u64,
) -> StoreResult<ShellOutput> {
    exec.query_one(
        &format!(
            "SELECT {COMMAND_COLUMNS},
                    substr(stdout, ?2 + 1), substr(stderr, ?3 + 1),
                    length(stdout), length(stderr)
               FROM S.shell_commands WHERE id = ?1"
        ),
        params![id, stdout_offset as i64, stderr_offset as i64],
        |row| {
            Ok(ShellOutput {
                command: command_from_row(row)?,
                stdout: row.get::<_, Option<Vec<u8>>>(7)?.unwrap_or_default(),
                stderr: row.get::<_, Option<Vec<u8>>>(8)?.unwrap_or_default(),
                stdout_len: row.get::<_, i64>(9)? as u64,
                stderr_len: row.get::<_, i64>(10)? as u64,
            })
        },
    )
}
