// crates/db/src/schema.rs
//! Per-session database schema.
//!
//! Applied through the owning handle's attach alias: the `S.` pseudo-schema
//! marker on every CREATE statement is rewritten to the alias. Statements
//! *inside* trigger bodies stay unqualified — SQLite resolves them in the
//! trigger's own schema and forbids cross-database references there.

use crate::error::StoreResult;
use crate::handle::SessionHandle;

/// The messages table is AUTOINCREMENT so row ids are never reused; the
/// legacy chosen_first fallback (`id >= 1`) depends on that.
pub const SESSION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS S.sessions (
    id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    last_updated_at INTEGER NOT NULL,
    system_prompt TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    workspace_id TEXT,
    primary_branch_id INTEGER,
    chosen_first_id INTEGER
);

CREATE TABLE IF NOT EXISTS S.branches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL DEFAULT '',
    parent_branch_id INTEGER,
    branch_from_message_id INTEGER,
    pending_confirmation TEXT
);

CREATE TABLE IF NOT EXISTS S.messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL DEFAULT '',
    branch_id INTEGER NOT NULL,
    parent_message_id INTEGER,
    chosen_next_id INTEGER,
    type TEXT NOT NULL,
    text TEXT NOT NULL DEFAULT '',
    attachments TEXT NOT NULL DEFAULT '[]',
    cumul_token_count INTEGER,
    model TEXT,
    generation INTEGER NOT NULL DEFAULT 0,
    state TEXT,
    aux TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS S.idx_messages_branch ON messages(session_id, branch_id, id);
CREATE INDEX IF NOT EXISTS S.idx_messages_parent ON messages(parent_message_id);

CREATE TABLE IF NOT EXISTS S.blobs (
    id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    ref_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS S.session_envs (
    session_id TEXT NOT NULL DEFAULT '',
    generation INTEGER NOT NULL,
    roots TEXT NOT NULL DEFAULT '[]',
    UNIQUE (session_id, generation)
);

CREATE TABLE IF NOT EXISTS S.shell_commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL DEFAULT '',
    branch_id INTEGER NOT NULL,
    command TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    stdout BLOB NOT NULL DEFAULT x'',
    stderr BLOB NOT NULL DEFAULT x'',
    exit_code INTEGER,
    started_at INTEGER NOT NULL,
    finished_at INTEGER
);

CREATE TRIGGER IF NOT EXISTS S.messages_blob_ref_insert
AFTER INSERT ON messages
WHEN NEW.attachments IS NOT NULL AND NEW.attachments <> '[]'
BEGIN
    UPDATE blobs SET ref_count = ref_count + 1
     WHERE id IN (SELECT json_extract(j.value, '$.hash') FROM json_each(NEW.attachments) AS j);
END;

CREATE TRIGGER IF NOT EXISTS S.messages_blob_ref_delete
AFTER DELETE ON messages
WHEN OLD.attachments IS NOT NULL AND OLD.attachments <> '[]'
BEGIN
    UPDATE blobs SET ref_count = ref_count - 1
     WHERE id IN (SELECT json_extract(j.value, '$.hash') FROM json_each(OLD.attachments) AS j);
    DELETE FROM blobs WHERE ref_count <= 0;
END;

CREATE TRIGGER IF NOT EXISTS S.messages_blob_ref_update
AFTER UPDATE OF attachments ON messages
WHEN OLD.attachments IS NOT NEW.attachments
BEGIN
    UPDATE blobs SET ref_count = ref_count - 1
     WHERE id IN (SELECT json_extract(j.value, '$.hash') FROM json_each(OLD.attachments) AS j);
    UPDATE blobs SET ref_count = ref_count + 1
     WHERE id IN (SELECT json_extract(j.value, '$.hash') FROM json_each(NEW.attachments) AS j);
    DELETE FROM blobs WHERE ref_count <= 0;
END;
"#;

/// Apply the per-session schema through a leased handle.
pub fn apply_session_schema(handle: &SessionHandle) -> StoreResult<()> {
    handle.execute_batch(SESSION_SCHEMA)
}
