// crates/server/src/routes/sessions.rs
//! Session endpoints.
//!
//! - `GET /api/sessions`                    -- list sessions
//! - `POST /api/sessions`                   -- create a session
//! - `GET /api/sessions/{id}`               -- open the SSE event stream
//! - `GET /api/sessions/{id}/history`       -- paginated history
//! - `POST /api/sessions/{id}/messages`     -- send / edit / retry / continue
//! - `POST /api/sessions/{id}/branch`       -- switch the primary branch
//! - `POST /api/sessions/{id}/confirm`      -- approve a pending tool call
//! - `POST /api/sessions/{id}/cancel`       -- cancel the in-flight call
//! - `POST /api/sessions/{id}/compress`     -- insert a compression message
//! - `POST /api/sessions/{id}/roots`        -- change exposed directory roots
//! - `DELETE /api/sessions/{id}`            -- delete a session

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use angel_db::{
    append_message, edit_message, history, rename_session, retry_message, session_meta,
    set_pending_confirmation, switch_primary_branch, HistoryOptions, NewMessage,
};
use angel_types::{HistoryMessage, MessageType, SendMessageRequest, SessionMeta, StreamEvent};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::stream::{build_initial_state, start_model_call};

const PING_INTERVAL: Duration = Duration::from_secs(15);

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/{id}",
            get(open_stream).delete(delete_session),
        )
        .route("/sessions/{id}/history", get(get_history))
        .route("/sessions/{id}/messages", post(post_message))
        .route("/sessions/{id}/branch", post(switch_branch))
        .route("/sessions/{id}/confirm", post(confirm_tool))
        .route("/sessions/{id}/cancel", post(cancel_call))
        .route("/sessions/{id}/compress", post(compress))
        .route("/sessions/{id}/roots", post(change_roots))
        .route("/sessions/{id}/rename", post(rename))
}

// ============================================================================
// Listing / lifecycle
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub workspace: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionsResponse {
    sessions: Vec<SessionMeta>,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<SessionsResponse>> {
    let sessions = state.store.list_sessions(query.workspace.as_deref())?;
    Ok(Json(SessionsResponse { sessions }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    /// Temporary sessions (`.`-prefixed ids) are cleaned up when idle.
    #[serde(default)]
    temporary: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
    primary_branch_id: i64,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    let id = if req.temporary {
        angel_core::session_id::generate_temporary()
    } else {
        angel_core::session_id::generate()
    };

    // Default prompt comes from the workspace when one is given.
    let system_prompt = match (&req.system_prompt, &req.workspace_id) {
        (Some(prompt), _) => prompt.clone(),
        (None, Some(ws)) => state.store.get_workspace(ws)?.default_system_prompt,
        (None, None) => String::new(),
    };

    let (handle, primary_branch_id) = state
        .store
        .create_session(&id, &system_prompt, req.workspace_id.as_deref())
        .await?;
    drop(handle);

    Ok(Json(CreateSessionResponse {
        session_id: id,
        primary_branch_id,
    }))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    // Make sure the row exists so a bogus id 404s instead of silently
    // succeeding.
    state.store.get_session_meta(&id)?;
    state.streams.cancel(&angel_core::session_id::SessionId::parse(&id).main);
    state.store.delete_session(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

// ============================================================================
// SSE stream
// ============================================================================

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

fn sse_event(event: &StreamEvent) -> Result<Event, Infallible> {
    Ok(Event::default().data(event.encode()))
}

/// GET /api/sessions/{id} -- open the event stream.
///
/// Replays the session state as `W` then `I` (call in flight, stream stays
/// open and joins it) or `i` (idle, stream closes after the event).
async fn open_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sse<EventStream>> {
    let cancel = CancellationToken::new();
    let handle = state.store.with_session(&id, &cancel).await?;
    let (initial, call) = build_initial_state(&state, &handle)?;
    let workspace_id = initial.session.workspace_id.clone();

    let stream: EventStream = Box::pin(async_stream::stream! {
        if let Some(workspace_id) = workspace_id {
            yield sse_event(&StreamEvent::WorkspaceHint { workspace_id });
        }

        match call {
            None => {
                yield sse_event(&StreamEvent::Initial {
                    state: Box::new(initial),
                    call_active: false,
                });
            }
            Some(call) => {
                let mut rx = call.subscribe();
                yield sse_event(&StreamEvent::Initial {
                    state: Box::new(initial),
                    call_active: true,
                });

                let mut ping = tokio::time::interval_at(
                    tokio::time::Instant::now() + PING_INTERVAL,
                    PING_INTERVAL,
                );
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Ok(event) => {
                                let terminal = matches!(event, StreamEvent::Finished);
                                yield sse_event(&event);
                                if terminal {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!(lagged = n, "SSE subscriber lagged");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                                yield sse_event(&StreamEvent::Finished);
                                break;
                            }
                        },
                        _ = ping.tick() => {
                            yield sse_event(&StreamEvent::Ping);
                        }
                    }
                }
            }
        }
        // `handle` lives as long as the stream so the lease spans it.
        drop(handle);
    });

    Ok(Sse::new(stream))
}

// ============================================================================
// History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub before: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    messages: Vec<HistoryMessage>,
    has_more: bool,
}

/// GET /api/sessions/{id}/history?before=<id>&limit=N
async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let cancel = CancellationToken::new();
    let handle = state.store.with_session(&id, &cancel).await?;
    let page = history(
        &handle,
        &HistoryOptions {
            before_id: query.before,
            limit: Some(query.limit.unwrap_or(50).clamp(1, 500)),
            can_alter_history: false,
        },
    )?;
    Ok(Json(HistoryResponse {
        messages: page.messages,
        has_more: page.has_more,
    }))
}

// ============================================================================
// Messages (send / edit / retry / continue)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageActionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<i64>,
    branch_id: i64,
}

/// POST /api/sessions/{id}/messages -- the four message operations share one
/// endpoint, distinguished by the body's `kind` tag. Each starts a model
/// call; the resulting events arrive on the open SSE stream.
async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<MessageActionResponse>> {
    let cancel = CancellationToken::new();
    let handle = state.store.with_session(&id, &cancel).await?;
    let meta = session_meta(&handle)?;
    let primary = meta
        .primary_branch_id
        .ok_or_else(|| ApiError::Internal(format!("session {id} has no primary branch")))?;

    match req {
        SendMessageRequest::Send {
            text,
            attachments,
            temp_id,
        } => {
            let new = NewMessage::user(text).with_attachments(attachments);
            let message = handle.transaction(|tx| append_message(tx, primary, &new))?;
            let call = start_model_call(state.clone(), handle, primary, false);
            call.send(StreamEvent::Acknowledge {
                temp_id,
                message_id: message.id,
            });
            Ok(Json(MessageActionResponse {
                message_id: Some(message.id),
                branch_id: primary,
            }))
        }
        SendMessageRequest::Edit {
            message_id,
            text,
            attachments,
        } => {
            let fork = edit_message(&handle, message_id, &text, attachments)?;
            let new_id = fork.message.as_ref().map(|m| m.id);
            let call = start_model_call(state.clone(), handle, fork.branch_id, false);
            if let Some(new_id) = new_id {
                // The client resolves the old id from its pending-rebind
                // register; the event carries only the new one.
                call.send(StreamEvent::Acknowledge {
                    temp_id: None,
                    message_id: new_id,
                });
            }
            Ok(Json(MessageActionResponse {
                message_id: new_id,
                branch_id: fork.branch_id,
            }))
        }
        SendMessageRequest::Retry { message_id } => {
            let fork = retry_message(&handle, message_id)?;
            // The regenerated message only exists once streaming starts;
            // the dispatcher acknowledges it on creation.
            start_model_call(state.clone(), handle, fork.branch_id, true);
            Ok(Json(MessageActionResponse {
                message_id: None,
                branch_id: fork.branch_id,
            }))
        }
        SendMessageRequest::Continue => {
            start_model_call(state.clone(), handle, primary, false);
            Ok(Json(MessageActionResponse {
                message_id: None,
                branch_id: primary,
            }))
        }
    }
}

// ============================================================================
// Branch / confirm / cancel / compress / roots / rename
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwitchBranchRequest {
    branch_id: i64,
}

async fn switch_branch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SwitchBranchRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancel = CancellationToken::new();
    let handle = state.store.with_session(&id, &cancel).await?;
    switch_primary_branch(&handle, req.branch_id)?;
    Ok(Json(serde_json::json!({ "primaryBranchId": req.branch_id })))
}

/// POST /api/sessions/{id}/confirm -- approve the pending tool call. Clears
/// the stored blob and resumes with a continue-style model call.
async fn confirm_tool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageActionResponse>> {
    let cancel = CancellationToken::new();
    let handle = state.store.with_session(&id, &cancel).await?;
    let meta = session_meta(&handle)?;
    let primary = meta
        .primary_branch_id
        .ok_or_else(|| ApiError::Internal(format!("session {id} has no primary branch")))?;

    let pending = angel_db::pending_confirmation(&handle, primary)?;
    if pending.is_none() {
        return Err(ApiError::Conflict("no pending confirmation".to_string()));
    }
    set_pending_confirmation(&handle, primary, None)?;
    start_model_call(state.clone(), handle, primary, false);
    Ok(Json(MessageActionResponse {
        message_id: None,
        branch_id: primary,
    }))
}

async fn cancel_call(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let main = angel_core::session_id::SessionId::parse(&id).main;
    let cancelled = state.streams.cancel(&main);
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompressRequest {
    /// Defaults to the current history tail, compressing everything so far.
    #[serde(default)]
    last_included_id: Option<i64>,
    /// When absent, the configured model adapter produces the summary.
    #[serde(default)]
    summary: Option<String>,
}

/// POST /api/sessions/{id}/compress -- insert a compression message,
/// `"<lastIncludedID>\n<summary>"`. With no summary in the body, one is
/// generated by a one-shot model call over the effective context.
async fn compress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CompressRequest>,
) -> ApiResult<Json<MessageActionResponse>> {
    let cancel = CancellationToken::new();
    let handle = state.store.with_session(&id, &cancel).await?;
    let meta = session_meta(&handle)?;
    let primary = meta
        .primary_branch_id
        .ok_or_else(|| ApiError::Internal(format!("session {id} has no primary branch")))?;

    let last_included_id = match req.last_included_id {
        Some(id) => id,
        None => {
            let page = history(&handle, &HistoryOptions::default())?;
            page.messages
                .last()
                .map(|m| m.message.id)
                .ok_or_else(|| ApiError::BadRequest("nothing to compress".to_string()))?
        }
    };
    let summary = match req.summary {
        Some(summary) => summary,
        None => crate::stream::summarize_for_compression(&state, &handle).await?,
    };

    let text = format!("{last_included_id}\n{summary}");
    let new = NewMessage::of_type(MessageType::Compression, text);
    let message = handle.transaction(|tx| append_message(tx, primary, &new))?;
    Ok(Json(MessageActionResponse {
        message_id: Some(message.id),
        branch_id: primary,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RootsRequest {
    roots: Vec<String>,
}

/// POST /api/sessions/{id}/roots -- expose/unexpose directories. Appends a
/// new environment generation and an `env_changed` message, and notifies any
/// open stream with `G`.
async fn change_roots(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RootsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancel = CancellationToken::new();
    let handle = state.store.with_session(&id, &cancel).await?;
    let meta = session_meta(&handle)?;
    let primary = meta
        .primary_branch_id
        .ok_or_else(|| ApiError::Internal(format!("session {id} has no primary branch")))?;

    let generation = if angel_db::envs::latest_env(&handle)?.is_none() {
        angel_db::envs::set_initial_env(&handle, &req.roots)?;
        0
    } else {
        angel_db::envs::push_env(&handle, &req.roots)?
    };

    let mut new = NewMessage::of_type(MessageType::EnvChanged, "");
    new.generation = Some(generation);
    new.aux = Some(serde_json::json!({ "roots": req.roots }));
    handle.transaction(|tx| append_message(tx, primary, &new))?;

    if let Some(call) = state.streams.get(&handle.session_id().main) {
        let payload = serde_json::json!({ "generation": generation, "roots": req.roots });
        call.send(StreamEvent::EnvChanged {
            payload: payload.to_string(),
        });
    }
    Ok(Json(serde_json::json!({ "generation": generation })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameRequest {
    name: String,
}

async fn rename(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancel = CancellationToken::new();
    let handle = state.store.with_session(&id, &cancel).await?;
    rename_session(&handle, &req.name)?;
    if let Some(call) = state.streams.get(&handle.session_id().main) {
        call.send(StreamEvent::SessionRenamed {
            session_id: id.clone(),
            name: req.name.clone(),
        });
    }
    Ok(Json(serde_json::json!({ "renamed": id })))
}
