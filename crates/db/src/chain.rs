// crates/db/src/chain.rs
//! Branch-aware message chain: append, edit, retry, and the history walker.
//!
//! Messages form a per-session DAG. Every message points at its parent;
//! `chosen_next_id` picks the current continuation, so following it from the
//! session's `chosen_first_id` yields the spine of the current conversation.
//! Siblings of a chosen child are the alternative branches created by
//! edit/retry.
//!
//! Traversal works on integer row ids through explicit SQL lookups; no
//! in-memory graph is materialized.

use rusqlite::params;
use serde::Deserialize;

use angel_types::{Attachment, BranchChoice, HistoryMessage, Message, MessageType};

use crate::error::{StoreError, StoreResult};
use crate::handle::{SessionExec, SessionHandle};

/// Fallback lower bound for sessions predating `chosen_first_id`. Safe only
/// because `messages` is AUTOINCREMENT: row ids are never reused, so every
/// surviving message has `id >= 1` and no deleted id can reappear below the
/// walk window.
pub const LEGACY_FIRST_MESSAGE_ID: i64 = 1;

const MESSAGE_COLUMNS: &str = "id, session_id, branch_id, parent_message_id, chosen_next_id, \
     type, text, attachments, cumul_token_count, model, generation, state, aux, created_at";

/// The same column list qualified with the `m` table alias.
const MESSAGE_COLUMNS_M: &str = "m.id, m.session_id, m.branch_id, m.parent_message_id, \
     m.chosen_next_id, m.type, m.text, m.attachments, m.cumul_token_count, m.model, \
     m.generation, m.state, m.aux, m.created_at";

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let type_str: String = row.get(5)?;
    let message_type = MessageType::parse(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown message type {type_str:?}").into(),
        )
    })?;
    let attachments_json: String = row.get(7)?;
    let attachments: Vec<Attachment> =
        serde_json::from_str(&attachments_json).unwrap_or_default();
    let aux_json: Option<String> = row.get(12)?;
    let aux = aux_json.and_then(|s| serde_json::from_str(&s).ok());

    Ok(Message {
        id: row.get(0)?,
        branch_id: row.get(2)?,
        parent_message_id: row.get(3)?,
        chosen_next_id: row.get(4)?,
        message_type,
        text: row.get(6)?,
        attachments,
        cumul_token_count: row.get(8)?,
        model: row.get(9)?,
        generation: row.get(10)?,
        state: row.get(11)?,
        aux,
        created_at: row.get(13)?,
    })
}

/// Fetch one message by id within the executor's session.
pub fn get_message<E: SessionExec>(exec: &E, id: i64) -> StoreResult<Option<Message>> {
    exec.query_row_opt(
        &format!("SELECT {MESSAGE_COLUMNS} FROM S.messages WHERE id = ?1 AND session_id = ?2"),
        params![id, exec.id().local],
        message_from_row,
    )
}

/// The current tail of a branch: the message with `chosen_next_id IS NULL`
/// that is actually on the spine. Orphaned inserts (an append that died
/// between its INSERT and the parent's pointer UPDATE) share the branch id
/// but are excluded because their parent's `chosen_next_id` points elsewhere.
pub fn last_message_in_branch<E: SessionExec>(
    exec: &E,
    branch_id: i64,
) -> StoreResult<Option<Message>> {
    exec.query_row_opt(
        &format!(
            "SELECT {MESSAGE_COLUMNS_M} FROM S.messages m
             LEFT JOIN S.messages p ON p.id = m.parent_message_id
             WHERE m.branch_id = ?1 AND m.session_id = ?2 AND m.chosen_next_id IS NULL
               AND (m.parent_message_id IS NULL
                    OR p.branch_id <> m.branch_id
                    OR p.chosen_next_id = m.id)
             ORDER BY m.id DESC LIMIT 1"
        ),
        params![branch_id, exec.id().local],
        message_from_row,
    )
}

/// The message a forked branch continues from (`branch_from_message_id`),
/// used as the append parent while the branch is still empty.
fn branch_fork_parent<E: SessionExec>(exec: &E, branch_id: i64) -> StoreResult<Option<Message>> {
    let fork_id: Option<Option<i64>> = exec.query_row_opt(
        "SELECT branch_from_message_id FROM S.branches WHERE id = ?1",
        params![branch_id],
        |row| row.get(0),
    )?;
    match fork_id.flatten() {
        Some(id) => exec.query_row_opt(
            &format!("SELECT {MESSAGE_COLUMNS} FROM S.messages WHERE id = ?1"),
            params![id],
            message_from_row,
        ),
        None => Ok(None),
    }
}

/// Input for [`append_message`]. `model`/`generation` inherit from the tail
/// when unset.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub message_type: Option<MessageType>,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub cumul_token_count: Option<i64>,
    pub model: Option<String>,
    pub generation: Option<i64>,
    pub state: Option<String>,
    pub aux: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn of_type(message_type: MessageType, text: impl Into<String>) -> Self {
        Self {
            message_type: Some(message_type),
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::of_type(MessageType::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::of_type(MessageType::Model, text)
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Append a message to the tail of `branch_id`.
///
/// Runs inside the caller's transaction. The insert carries the parent
/// pointer; only afterwards is the parent's `chosen_next_id` (or the
/// session's `chosen_first_id`) flipped to the new row. A crash between the
/// two steps leaves a well-formed alternative branch that the history walker
/// surfaces via `possible_branches`.
pub fn append_message<E: SessionExec>(
    exec: &E,
    branch_id: i64,
    new: &NewMessage,
) -> StoreResult<Message> {
    let tail = last_message_in_branch(exec, branch_id)?;
    let anchor = match tail {
        Some(t) => Some(t),
        None => branch_fork_parent(exec, branch_id)?,
    };

    let (parent_id, inherited_generation, inherited_model) = match &anchor {
        Some(a) => (Some(a.id), a.generation, a.model.clone()),
        None => (None, 0, None),
    };

    let message_type = new.message_type.ok_or_else(|| {
        StoreError::Corrupt("append without a message type".to_string())
    })?;
    let generation = new.generation.unwrap_or(inherited_generation);
    let model = new.model.clone().or(inherited_model);
    let attachments_json = serde_json::to_string(&new.attachments)?;
    let aux_json = new
        .aux
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let now = now_ts();

    let id: i64 = exec.query_one(
        "INSERT INTO S.messages
             (session_id, branch_id, parent_message_id, type, text, attachments,
              cumul_token_count, model, generation, state, aux, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         RETURNING id",
        params![
            exec.id().local,
            branch_id,
            parent_id,
            message_type.as_str(),
            new.text,
            attachments_json,
            new.cumul_token_count,
            model,
            generation,
            new.state,
            aux_json,
            now,
        ],
        |row| row.get(0),
    )?;

    match parent_id {
        Some(pid) => {
            exec.execute(
                "UPDATE S.messages SET chosen_next_id = ?1 WHERE id = ?2",
                params![id, pid],
            )?;
        }
        None => {
            exec.execute(
                "UPDATE S.sessions SET chosen_first_id = ?1 WHERE id = ?2",
                params![id, exec.id().local],
            )?;
        }
    }

    touch_session(exec, now)?;

    let message = get_message(exec, id)?
        .ok_or_else(|| StoreError::Corrupt(format!("message {id} vanished after insert")))?;
    project_searchable(exec, &message)?;
    Ok(message)
}

/// Mirror a user/model message into the catalog's searchable projection.
///
/// Our own writes never re-trigger the watcher (the commit hook flags them
/// as expected changes), so the projection is maintained here, atomically
/// with the message write on the shared connection. External modifications
/// are re-projected wholesale by the watcher instead.
fn project_searchable<E: SessionExec>(exec: &E, message: &Message) -> StoreResult<()> {
    if !message.message_type.is_searchable() {
        return Ok(());
    }
    let catalog_id = exec.id().to_wire();
    if catalog_id.is_empty() {
        return Ok(());
    }
    let escaped = angel_core::escape::escape_searchable(&message.text);
    exec.execute(
        "INSERT OR REPLACE INTO messages_searchable (session_id, message_id, type, text)
         VALUES (?1, ?2, ?3, ?4)",
        params![catalog_id, message.id, message.message_type.as_str(), escaped],
    )?;
    exec.execute(
        "DELETE FROM message_stems WHERE session_id = ?1 AND message_id = ?2",
        params![catalog_id, message.id],
    )?;
    exec.execute(
        "DELETE FROM message_trigrams WHERE session_id = ?1 AND message_id = ?2",
        params![catalog_id, message.id],
    )?;
    exec.execute(
        "INSERT INTO message_stems (session_id, message_id, text) VALUES (?1, ?2, ?3)",
        params![catalog_id, message.id, escaped],
    )?;
    exec.execute(
        "INSERT INTO message_trigrams (session_id, message_id, text) VALUES (?1, ?2, ?3)",
        params![catalog_id, message.id, escaped],
    )?;
    Ok(())
}

/// Bump `last_updated_at` on the authoritative session row and the catalog's
/// denormalized copy. Both sit on the same connection, so the update is
/// atomic with the surrounding transaction.
fn touch_session<E: SessionExec>(exec: &E, now: i64) -> StoreResult<()> {
    exec.execute(
        "UPDATE S.sessions SET last_updated_at = ?1 WHERE id = ?2",
        params![now, exec.id().local],
    )?;
    let wire = exec.id().to_wire();
    if !wire.is_empty() {
        exec.execute(
            "UPDATE sessions SET last_updated_at = ?1 WHERE id = ?2",
            params![now, wire],
        )?;
    }
    Ok(())
}

/// Update a streamed message's text in place (model/thought accumulation).
pub fn set_message_text<E: SessionExec>(exec: &E, id: i64, text: &str) -> StoreResult<()> {
    let n = exec.execute(
        "UPDATE S.messages SET text = ?1 WHERE id = ?2 AND session_id = ?3",
        params![text, id, exec.id().local],
    )?;
    if n == 0 {
        return Err(StoreError::not_found(format!("message {id}")));
    }
    if let Some(message) = get_message(exec, id)? {
        project_searchable(exec, &message)?;
    }
    Ok(())
}

/// Record a cumulative token count for a message.
pub fn set_token_count<E: SessionExec>(exec: &E, id: i64, count: i64) -> StoreResult<()> {
    exec.execute(
        "UPDATE S.messages SET cumul_token_count = ?1 WHERE id = ?2 AND session_id = ?3",
        params![count, id, exec.id().local],
    )?;
    Ok(())
}

/// Store or clear the opaque tool-approval blob on a branch.
pub fn set_pending_confirmation<E: SessionExec>(
    exec: &E,
    branch_id: i64,
    blob: Option<&str>,
) -> StoreResult<()> {
    exec.execute(
        "UPDATE S.branches SET pending_confirmation = ?1 WHERE id = ?2",
        params![blob, branch_id],
    )?;
    Ok(())
}

pub fn pending_confirmation<E: SessionExec>(
    exec: &E,
    branch_id: i64,
) -> StoreResult<Option<String>> {
    Ok(exec
        .query_row_opt(
            "SELECT pending_confirmation FROM S.branches WHERE id = ?1",
            params![branch_id],
            |row| row.get::<_, Option<String>>(0),
        )?
        .flatten())
}

/// Result of an edit or retry: the fork landed in a fresh branch which is
/// now the session's primary.
#[derive(Debug)]
pub struct Fork {
    pub branch_id: i64,
    /// The replacement message; `None` for retry, where the regenerated
    /// model message is appended by the streaming call that follows.
    pub message: Option<Message>,
}

/// Edit an existing message: fork a new branch at the target's parent,
/// insert the replacement there, and repoint the spine (and primary branch)
/// at it. The old lineage survives as an alternative branch.
pub fn edit_message(
    handle: &SessionHandle,
    message_id: i64,
    text: &str,
    attachments: Vec<Attachment>,
) -> StoreResult<Fork> {
    handle.transaction(|tx| {
        let orig = get_message(tx, message_id)?
            .ok_or_else(|| StoreError::not_found(format!("message {message_id}")))?;

        let branch_id = new_branch(tx, orig.branch_id, orig.parent_message_id)?;
        let attachments_json = serde_json::to_string(&attachments)?;
        let now = now_ts();

        let new_id: i64 = tx.query_one(
            "INSERT INTO S.messages
                 (session_id, branch_id, parent_message_id, type, text, attachments,
                  cumul_token_count, model, generation, state, aux, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, NULL, NULL, ?9)
             RETURNING id",
            params![
                tx.id().local,
                branch_id,
                orig.parent_message_id,
                orig.message_type.as_str(),
                text,
                attachments_json,
                orig.model,
                orig.generation,
                now,
            ],
            |row| row.get(0),
        )?;

        repoint_spine(tx, orig.parent_message_id, Some(new_id))?;
        set_primary_branch_rows(tx, branch_id, now)?;

        let message = get_message(tx, new_id)?
            .ok_or_else(|| StoreError::Corrupt(format!("message {new_id} vanished")))?;
        project_searchable(tx, &message)?;
        Ok(Fork {
            branch_id,
            message: Some(message),
        })
    })
}

/// Retry a message: fork a new branch at the target's parent and leave it
/// empty. The spine is cut back to the parent; the follow-up model call
/// appends the regenerated message into the new branch.
pub fn retry_message(handle: &SessionHandle, message_id: i64) -> StoreResult<Fork> {
    handle.transaction(|tx| {
        let orig = get_message(tx, message_id)?
            .ok_or_else(|| StoreError::not_found(format!("message {message_id}")))?;

        let branch_id = new_branch(tx, orig.branch_id, orig.parent_message_id)?;
        repoint_spine(tx, orig.parent_message_id, None)?;
        set_primary_branch_rows(tx, branch_id, now_ts())?;

        Ok(Fork {
            branch_id,
            message: None,
        })
    })
}

/// Switch the session's primary branch (the `POST /branch` operation).
pub fn switch_primary_branch(handle: &SessionHandle, branch_id: i64) -> StoreResult<()> {
    handle.transaction(|tx| {
        let exists: Option<i64> = tx.query_row_opt(
            "SELECT id FROM S.branches WHERE id = ?1",
            params![branch_id],
            |row| row.get(0),
        )?;
        if exists.is_none() {
            return Err(StoreError::not_found(format!("branch {branch_id}")));
        }
        // Repoint the fork ancestor's spine at this branch's first message.
        let first: Option<Message> = tx
            .query_row_opt(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM S.messages
                     WHERE branch_id = ?1 AND session_id = ?2 ORDER BY id ASC LIMIT 1"
                ),
                params![branch_id, tx.id().local],
                message_from_row,
            )?;
        if let Some(first) = first {
            repoint_spine(tx, first.parent_message_id, Some(first.id))?;
        }
        set_primary_branch_rows(tx, branch_id, now_ts())?;
        Ok(())
    })
}

fn new_branch<E: SessionExec>(
    exec: &E,
    parent_branch_id: i64,
    fork_from: Option<i64>,
) -> StoreResult<i64> {
    exec.query_one(
        "INSERT INTO S.branches (session_id, parent_branch_id, branch_from_message_id)
         VALUES (?1, ?2, ?3) RETURNING id",
        params![exec.id().local, parent_branch_id, fork_from],
        |row| row.get(0),
    )
}

/// Point the spine at `next`: the parent's `chosen_next_id`, or the
/// session's `chosen_first_id` when forking at the virtual root.
fn repoint_spine<E: SessionExec>(
    exec: &E,
    parent_id: Option<i64>,
    next: Option<i64>,
) -> StoreResult<()> {
    match parent_id {
        Some(pid) => {
            exec.execute(
                "UPDATE S.messages SET chosen_next_id = ?1 WHERE id = ?2",
                params![next, pid],
            )?;
        }
        None => {
            exec.execute(
                "UPDATE S.sessions SET chosen_first_id = ?1 WHERE id = ?2",
                params![next, exec.id().local],
            )?;
        }
    }
    Ok(())
}

fn set_primary_branch_rows<E: SessionExec>(exec: &E, branch_id: i64, now: i64) -> StoreResult<()> {
    exec.execute(
        "UPDATE S.sessions SET primary_branch_id = ?1, last_updated_at = ?2 WHERE id = ?3",
        params![branch_id, now, exec.id().local],
    )?;
    let wire = exec.id().to_wire();
    if !wire.is_empty() {
        exec.execute(
            "UPDATE sessions SET primary_branch_id = ?1, last_updated_at = ?2 WHERE id = ?3",
            params![branch_id, now, wire],
        )?;
    }
    Ok(())
}

/// A chain cursor holding the cached tail of one branch, so streaming
/// appends don't re-query it on every chunk.
pub struct MessageChain {
    branch_id: i64,
    tail: Option<Message>,
}

impl MessageChain {
    pub fn load<E: SessionExec>(exec: &E, branch_id: i64) -> StoreResult<Self> {
        let tail = last_message_in_branch(exec, branch_id)?;
        Ok(Self { branch_id, tail })
    }

    pub fn branch_id(&self) -> i64 {
        self.branch_id
    }

    pub fn tail(&self) -> Option<&Message> {
        self.tail.as_ref()
    }

    /// Append through the handle in one transaction and refresh the cache.
    pub fn append(&mut self, handle: &SessionHandle, new: &NewMessage) -> StoreResult<Message> {
        let message = handle.transaction(|tx| append_message(tx, self.branch_id, new))?;
        self.tail = Some(message.clone());
        Ok(message)
    }
}

// ============================================================================
// History retrieval
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    /// Return only messages strictly before this id (cursor pagination).
    pub before_id: Option<i64>,
    /// Maximum number of messages; unlimited when `None`.
    pub limit: Option<usize>,
    /// LLM-context mode: honour compression / `clear` / `clearblobs`.
    pub can_alter_history: bool,
}

#[derive(Debug)]
pub struct HistoryPage {
    /// Chronological order, oldest first.
    pub messages: Vec<HistoryMessage>,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ChildRow {
    id: i64,
    #[serde(rename = "branchId")]
    branch_id: i64,
    text: String,
    ts: i64,
}

struct SessionPointers {
    primary_branch_id: Option<i64>,
    chosen_first_id: Option<i64>,
}

fn session_pointers<E: SessionExec>(exec: &E) -> StoreResult<SessionPointers> {
    exec.query_one(
        "SELECT primary_branch_id, chosen_first_id FROM S.sessions WHERE id = ?1",
        params![exec.id().local],
        |row| {
            Ok(SessionPointers {
                primary_branch_id: row.get(0)?,
                chosen_first_id: row.get(1)?,
            })
        },
    )
}

/// One branch block, newest-first from SQLite, reversed to oldest-first.
/// The LEFT JOIN aggregates each row's direct children (across branches) for
/// the `possible_branches` computation.
fn fetch_branch_block<E: SessionExec>(
    exec: &E,
    branch_id: i64,
    start_id: i64,
    id_limit: i64,
    limit: Option<usize>,
) -> StoreResult<Vec<(Message, Vec<ChildRow>)>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS_M},
                json_group_array(json_object(
                    'id', mm.id, 'branchId', mm.branch_id, 'text', mm.text, 'ts', mm.created_at
                )) FILTER (WHERE mm.id IS NOT NULL) AS children
           FROM S.messages m
           LEFT JOIN S.messages mm ON mm.parent_message_id = m.id
          WHERE m.session_id = ?1 AND m.branch_id = ?2 AND m.id BETWEEN ?3 AND ?4
          GROUP BY m.id
          ORDER BY m.id DESC
          LIMIT ?5"
    );
    let limit_param: i64 = limit.map(|l| l as i64).unwrap_or(-1);
    let mut rows = exec.query_rows(
        &sql,
        params![exec.id().local, branch_id, start_id, id_limit, limit_param],
        |row| {
            let message = message_from_row(row)?;
            let children_json: Option<String> = row.get(14)?;
            Ok((message, children_json))
        },
    )?;
    rows.reverse();

    rows.into_iter()
        .map(|(message, children_json)| {
            let children = match children_json {
                Some(json) => serde_json::from_str::<Vec<ChildRow>>(&json)?,
                None => Vec::new(),
            };
            Ok((message, children))
        })
        .collect()
}

/// Children of the virtual root: all parentless messages in this session.
fn root_children<E: SessionExec>(exec: &E) -> StoreResult<Vec<ChildRow>> {
    exec.query_rows(
        "SELECT id, branch_id, text, created_at FROM S.messages
          WHERE parent_message_id IS NULL AND session_id = ?1 ORDER BY id",
        params![exec.id().local],
        |row| {
            Ok(ChildRow {
                id: row.get(0)?,
                branch_id: row.get(1)?,
                text: row.get(2)?,
                ts: row.get(3)?,
            })
        },
    )
}

/// Retrieve a history slice per the walker algorithm:
///
/// 1. start from the primary branch (or the cursor's branch, with the
///    single-step parent-branch fallback),
/// 2. fetch per-branch blocks backwards, recursing into the parent branch
///    whenever the block's first message has an out-of-block parent,
/// 3. over-fetch by one on paginated calls so the extra earliest row's
///    children supply `possible_branches` for the first returned row,
/// 4. in context mode, apply compression / `clear` / `clearblobs` rewrites.
pub fn history<E: SessionExec>(exec: &E, opts: &HistoryOptions) -> StoreResult<HistoryPage> {
    let pointers = session_pointers(exec)?;
    let mut branch_id = pointers.primary_branch_id.ok_or_else(|| {
        StoreError::Corrupt(format!("session {} has no primary branch", exec.id()))
    })?;
    let start_id = pointers.chosen_first_id.unwrap_or(LEGACY_FIRST_MESSAGE_ID);
    let mut id_limit = i64::MAX;

    if let Some(before) = opts.before_id {
        id_limit = before.saturating_sub(1);
        // The walk starts from the cursor's own branch, so "load more while
        // viewing a branch" yields the right lineage. When the cursor is a
        // branch's first message its parent lives one branch up: start from
        // the parent's branch bounded by the parent's id, the same move the
        // recursion below makes. The fallback is a single step by design.
        if let Some(anchor) = get_message(exec, before)? {
            branch_id = anchor.branch_id;
            if let Some(parent_id) = anchor.parent_message_id {
                if let Some(parent) = get_message(exec, parent_id)? {
                    if parent.branch_id != anchor.branch_id {
                        branch_id = parent.branch_id;
                        id_limit = parent.id;
                    }
                }
            }
        }
    }

    let want = opts.limit.map(|l| l + 1);
    let mut collected: Vec<(Message, Vec<ChildRow>)> = Vec::new();

    loop {
        let remaining = want.map(|w| w.saturating_sub(collected.len()));
        if remaining == Some(0) {
            break;
        }
        let block = fetch_branch_block(exec, branch_id, start_id, id_limit, remaining)?;
        if block.is_empty() {
            break;
        }
        collected.splice(0..0, block);

        let first = &collected[0].0;
        let Some(parent_id) = first.parent_message_id else {
            break;
        };
        if want.map(|w| collected.len() >= w).unwrap_or(false) {
            break;
        }
        match get_message(exec, parent_id)? {
            Some(parent) => {
                id_limit = parent.id;
                branch_id = parent.branch_id;
            }
            // Parent below the chosen-first window or gone; stop the walk.
            None => break,
        }
    }

    let has_more = want.map(|w| collected.len() >= w).unwrap_or(false);

    // Root siblings for the true first message (virtual-root children).
    let first_needs_root_siblings = collected
        .first()
        .map(|(m, _)| m.parent_message_id.is_none())
        .unwrap_or(false);
    let root_siblings = if first_needs_root_siblings {
        root_children(exec)?
    } else {
        Vec::new()
    };

    let mut messages: Vec<HistoryMessage> = Vec::with_capacity(collected.len());
    for i in 0..collected.len() {
        let (message, _) = &collected[i];
        let siblings: Vec<BranchChoice> = if i == 0 {
            if message.parent_message_id.is_none() {
                choices_from(&root_siblings, message.id)
            } else {
                Vec::new()
            }
        } else {
            let (prev, prev_children) = &collected[i - 1];
            if message.parent_message_id == Some(prev.id) {
                choices_from(prev_children, message.id)
            } else {
                Vec::new()
            }
        };
        messages.push(HistoryMessage {
            message: message.clone(),
            possible_branches: siblings,
        });
    }

    if has_more && !messages.is_empty() {
        // Drop the over-fetched earliest row; its children already populated
        // the new first row's possible_branches.
        messages.remove(0);
    }

    if opts.can_alter_history {
        apply_context_rules(&mut messages);
    }

    Ok(HistoryPage { messages, has_more })
}

fn choices_from(children: &[ChildRow], own_id: i64) -> Vec<BranchChoice> {
    children
        .iter()
        .filter(|c| c.id != own_id)
        .map(|c| BranchChoice {
            message_id: c.id,
            branch_id: c.branch_id,
            user_text: c.text.clone(),
            timestamp: c.ts,
        })
        .collect()
}

/// Rewrite the effective LLM context in place:
/// - the latest compression message hides everything at or below its
///   `lastIncludedID` and moves to the front carrying only its summary;
/// - a `clear` command truncates the context to the command itself;
/// - a `clearblobs` command marks all earlier attachments as omitted.
fn apply_context_rules(messages: &mut Vec<HistoryMessage>) {
    let mut clear_at: Option<usize> = None;
    let mut clearblobs_at: Option<usize> = None;
    let mut compression_at: Option<usize> = None;
    let mut compress_up_to: Option<i64> = None;

    for (i, hm) in messages.iter().enumerate().rev() {
        match hm.message.message_type {
            MessageType::Command => {
                let cmd = hm.message.text.trim();
                if cmd == "clear" && clear_at.is_none() {
                    clear_at = Some(i);
                }
                if cmd == "clearblobs" && clearblobs_at.is_none() {
                    clearblobs_at = Some(i);
                }
            }
            MessageType::Compression if compression_at.is_none() => {
                compression_at = Some(i);
                compress_up_to = hm.message.compression_parts().map(|(id, _)| id);
            }
            _ => {}
        }
    }

    let mut compression_msg: Option<HistoryMessage> = None;
    let mut out = Vec::with_capacity(messages.len());
    for (i, mut hm) in messages.drain(..).enumerate() {
        if let Some(clear_pos) = clear_at {
            if i < clear_pos {
                continue;
            }
        }
        if hm.message.message_type == MessageType::Compression {
            if Some(i) == compression_at {
                let summary = hm
                    .message
                    .compression_parts()
                    .map(|(_, s)| s.to_string());
                if let Some(summary) = summary {
                    hm.message.text = summary;
                }
                compression_msg = Some(hm);
            }
            // Superseded compressions drop out of the context entirely.
            continue;
        }
        if let Some(up_to) = compress_up_to {
            if hm.message.id <= up_to {
                continue;
            }
        }
        if let Some(blob_pos) = clearblobs_at {
            if i < blob_pos {
                for attachment in &mut hm.message.attachments {
                    attachment.omitted = true;
                }
            }
        }
        out.push(hm);
    }
    if let Some(compression) = compression_msg {
        out.insert(0, compression);
    }
    *messages = out;
}
