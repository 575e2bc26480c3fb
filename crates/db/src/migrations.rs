// crates/db/src/migrations.rs
//! Inline catalog migrations.
//!
//! Applied in order; a `_migrations` table tracks which versions have run so
//! non-idempotent statements execute exactly once. The per-session schema
//! lives in `schema.rs` and is applied through the attach alias instead.

/// Catalog schema, one migration per version (1-based).
pub const MIGRATIONS: &[&str] = &[
    // v1: workspaces
    r#"
    CREATE TABLE IF NOT EXISTS workspaces (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        default_system_prompt TEXT NOT NULL DEFAULT ''
    )
    "#,
    // v2: denormalized sessions catalog. The authoritative session row lives
    // in each session DB; this copy exists for listing and search.
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL,
        last_updated_at INTEGER NOT NULL,
        system_prompt TEXT NOT NULL DEFAULT '',
        name TEXT NOT NULL DEFAULT '',
        workspace_id TEXT,
        primary_branch_id INTEGER,
        chosen_first_id INTEGER
    )
    "#,
    // v3/v4: listing indexes
    "CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(last_updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_workspace ON sessions(workspace_id)",
    // v5/v6: opaque provider/auth storage consumed by external layers
    r#"
    CREATE TABLE IF NOT EXISTS provider_configs (
        provider TEXT PRIMARY KEY,
        config TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS oauth_tokens (
        provider TEXT PRIMARY KEY,
        token TEXT NOT NULL,
        expires_at INTEGER
    )
    "#,
    // v7: rebuildable projection of user/model messages. Text is stored with
    // '<' as U+000E and '>' as U+000F; readers reverse the mapping.
    r#"
    CREATE TABLE IF NOT EXISTS messages_searchable (
        session_id TEXT NOT NULL,
        message_id INTEGER NOT NULL,
        type TEXT NOT NULL,
        text TEXT NOT NULL,
        PRIMARY KEY (session_id, message_id)
    )
    "#,
    // v8: stemmed FTS index over the projection
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS message_stems USING fts5(
        session_id UNINDEXED,
        message_id UNINDEXED,
        text,
        tokenize = 'porter unicode61'
    )
    "#,
    // v9: trigram FTS index for substring-ish matching
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS message_trigrams USING fts5(
        session_id UNINDEXED,
        message_id UNINDEXED,
        text,
        tokenize = 'trigram'
    )
    "#,
];
