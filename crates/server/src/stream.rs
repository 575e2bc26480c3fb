// crates/server/src/stream.rs
//! Streaming dispatcher: drives one model call, persisting provider events
//! as messages and broadcasting wire events to every connected stream.
//!
//! Ordering contract: within one stream the server emits `W` (optionally)
//! then `I`/`i` first; events for the same message id then arrive in causal
//! order. The call finishes with `D` (or `E`) followed by `F`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use angel_db::{
    append_message, get_message, history, pending_confirmation, session_meta,
    set_message_text, set_pending_confirmation, set_token_count, HistoryOptions, NewMessage,
    SessionExec, SessionHandle,
};
use angel_types::{InitialState, MessageType, StreamEvent};

use crate::error::{ApiError, ApiResult};
use crate::provider::{ModelRequest, ProviderEvent};
use crate::registry::ActiveCall;
use crate::state::AppState;

/// Messages per page on the initial stream replay.
pub const HISTORY_PAGE_LIMIT: usize = 100;

/// Assemble the `I`/`i` payload for a session, plus the in-flight call if
/// one exists.
pub fn build_initial_state(
    state: &AppState,
    handle: &SessionHandle,
) -> ApiResult<(InitialState, Option<Arc<ActiveCall>>)> {
    let meta = session_meta(handle)?;
    let page = history(
        handle,
        &HistoryOptions {
            limit: Some(HISTORY_PAGE_LIMIT),
            ..Default::default()
        },
    )?;

    let workspace = match meta.workspace_id.as_deref() {
        Some(ws) => state.store.get_workspace(ws).ok(),
        None => None,
    };

    let pending = match meta.primary_branch_id {
        Some(branch_id) => pending_confirmation(handle, branch_id)?
            .and_then(|blob| serde_json::from_str(&blob).ok()),
        None => None,
    };

    let env_changed = angel_db::envs::latest_env(handle)?
        .filter(|env| env.generation > 0)
        .and_then(|env| serde_json::to_value(env).ok());

    let call = state.streams.get(&handle.session_id().main);

    let initial = InitialState {
        system_prompt: meta.system_prompt.clone(),
        primary_branch_id: meta.primary_branch_id,
        session: meta,
        history: page.messages,
        workspace,
        pending_confirmation: pending,
        env_changed,
        call_elapsed_time_seconds: call.as_ref().map(|c| c.elapsed_seconds()),
        has_more: page.has_more,
    };
    Ok((initial, call))
}

/// Begin a model call on `branch_id` and spawn the dispatcher task.
///
/// `ack_first_message` makes the dispatcher emit an `A` for the first model
/// message it creates — the retry path, where the authoritative id only
/// exists once streaming starts.
pub fn start_model_call(
    state: Arc<AppState>,
    handle: SessionHandle,
    branch_id: i64,
    ack_first_message: bool,
) -> Arc<ActiveCall> {
    let main_id = handle.session_id().main.clone();
    let call = state.streams.begin(&main_id, branch_id);

    let task_call = call.clone();
    tokio::spawn(async move {
        let result = drive_call(&state, &handle, &task_call, ack_first_message).await;
        match result {
            Ok(()) => task_call.send(StreamEvent::Done),
            Err(err) => {
                let text = err.to_string();
                let persisted = handle.transaction(|tx| {
                    append_message(
                        tx,
                        task_call.branch_id,
                        &NewMessage::of_type(MessageType::ModelError, text.clone()),
                    )
                });
                if let Err(persist_err) = persisted {
                    warn!(error = %persist_err, "failed to persist model error");
                }
                task_call.send(StreamEvent::Error { message: text });
            }
        }
        task_call.send(StreamEvent::Finished);
        state.streams.finish(&task_call);
    });

    call
}

/// Accumulates the open model/thought message of the current call segment.
/// A function call closes the segment; later text starts a new message.
#[derive(Default)]
struct Segment {
    model_id: Option<i64>,
    model_text: String,
    thought_id: Option<i64>,
    thought_text: String,
}

async fn drive_call(
    state: &AppState,
    handle: &SessionHandle,
    call: &Arc<ActiveCall>,
    ack_first_message: bool,
) -> ApiResult<()> {
    let Some(provider) = state.provider.clone() else {
        debug!(session_id = %handle.session_id(), "no provider configured; completing call");
        return Ok(());
    };

    let meta = session_meta(handle)?;
    let context = history(
        handle,
        &HistoryOptions {
            can_alter_history: true,
            ..Default::default()
        },
    )?;
    let continuation_state = context
        .messages
        .iter()
        .rev()
        .find(|m| m.message.message_type == MessageType::Model)
        .and_then(|m| m.message.state.clone());
    let model = context
        .messages
        .iter()
        .rev()
        .find_map(|m| m.message.model.clone());

    let request = ModelRequest {
        session_id: handle.session_id().to_wire(),
        system_prompt: meta.system_prompt,
        context: context.messages,
        model,
        continuation_state,
    };

    let (tx, mut rx) = mpsc::channel::<ProviderEvent>(64);
    let generate_cancel = call.cancel.clone();
    let generate = tokio::spawn(async move { provider.generate(request, tx, generate_cancel).await });

    let mut segment = Segment::default();
    let mut acked = !ack_first_message;

    loop {
        tokio::select! {
            _ = call.cancel.cancelled() => {
                // Cooperative teardown; partial messages stay persisted.
                debug!(session_id = %call.session_id, "model call cancelled");
                generate.abort();
                return Ok(());
            }
            event = rx.recv() => match event {
                Some(event) => {
                    apply_provider_event(handle, call, &mut segment, &mut acked, event)?;
                }
                None => break,
            }
        }
    }

    match generate.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ApiError::Internal(err.to_string())),
        Err(join_err) => Err(ApiError::Internal(format!("provider task failed: {join_err}"))),
    }
}

fn apply_provider_event(
    handle: &SessionHandle,
    call: &Arc<ActiveCall>,
    segment: &mut Segment,
    acked: &mut bool,
    event: ProviderEvent,
) -> ApiResult<()> {
    match event {
        ProviderEvent::Text(chunk) => {
            let id = match segment.model_id {
                Some(id) => {
                    segment.model_text.push_str(&chunk);
                    set_message_text(handle, id, &segment.model_text)?;
                    id
                }
                None => {
                    let message = handle.transaction(|tx| {
                        append_message(tx, call.branch_id, &NewMessage::model(chunk.clone()))
                    })?;
                    segment.model_id = Some(message.id);
                    segment.model_text = chunk.clone();
                    if !*acked {
                        *acked = true;
                        call.send(StreamEvent::Acknowledge {
                            temp_id: None,
                            message_id: message.id,
                        });
                    }
                    message.id
                }
            };
            call.send(StreamEvent::ModelText {
                message_id: id,
                text: chunk,
            });
        }
        ProviderEvent::Thought(chunk) => {
            let id = match segment.thought_id {
                Some(id) => {
                    segment.thought_text.push_str(&chunk);
                    set_message_text(handle, id, &segment.thought_text)?;
                    id
                }
                None => {
                    let message = handle.transaction(|tx| {
                        append_message(
                            tx,
                            call.branch_id,
                            &NewMessage::of_type(MessageType::Thought, chunk.clone()),
                        )
                    })?;
                    segment.thought_id = Some(message.id);
                    segment.thought_text = chunk.clone();
                    message.id
                }
            };
            call.send(StreamEvent::Thought {
                message_id: id,
                text: chunk,
            });
        }
        ProviderEvent::FunctionCall { name, args_json } => {
            let mut new = NewMessage::of_type(MessageType::FunctionCall, args_json.clone());
            new.aux = Some(serde_json::json!({ "name": name }));
            let message =
                handle.transaction(|tx| append_message(tx, call.branch_id, &new))?;
            // The model continues in a fresh message after the tool round.
            *segment = Segment::default();
            call.send(StreamEvent::FunctionCall {
                message_id: message.id,
                name,
                args: args_json,
            });
        }
        ProviderEvent::FunctionResponse { name, payload_json } => {
            let mut new =
                NewMessage::of_type(MessageType::FunctionResponse, payload_json.clone());
            new.aux = Some(serde_json::json!({ "name": name }));
            let message =
                handle.transaction(|tx| append_message(tx, call.branch_id, &new))?;
            call.send(StreamEvent::FunctionResponse {
                message_id: message.id,
                name,
                payload: payload_json,
            });
        }
        ProviderEvent::InlineData { attachments } => {
            let id = ensure_model_message(handle, call, segment, acked)?;
            let merged = handle.transaction(|tx| {
                let mut message = get_message(tx, id)?.ok_or_else(|| {
                    angel_db::StoreError::Corrupt(format!("message {id} vanished"))
                })?;
                message.attachments.extend(attachments.iter().cloned());
                let json = serde_json::to_string(&message.attachments)?;
                tx.execute(
                    "UPDATE S.messages SET attachments = ?1 WHERE id = ?2",
                    rusqlite::params![json, id],
                )?;
                Ok(message.attachments)
            })?;
            let payload = serde_json::json!({ "messageID": id, "attachments": merged });
            call.send(StreamEvent::InlineData {
                payload: payload.to_string(),
            });
        }
        ProviderEvent::TokenCount(count) => {
            if let Some(id) = segment.model_id {
                set_token_count(handle, id, count)?;
                call.send(StreamEvent::TokenCount {
                    message_id: id,
                    count,
                });
            }
        }
        ProviderEvent::PendingConfirmation(blob) => {
            set_pending_confirmation(handle, call.branch_id, Some(&blob))?;
            call.send(StreamEvent::PendingConfirmation { payload: blob });
        }
    }
    Ok(())
}

/// The instruction used when the client asks for compression without
/// supplying its own summary.
const COMPRESSION_PROMPT: &str = "Summarize the conversation so far into a compact \
     brief that preserves every fact, decision, and open thread needed to continue it.";

/// Produce a compression summary by running a one-shot provider call over
/// the current effective context. Only the text chunks are kept; tool
/// traffic from the summarizer is ignored.
pub async fn summarize_for_compression(
    state: &AppState,
    handle: &SessionHandle,
) -> ApiResult<String> {
    let Some(provider) = state.provider.clone() else {
        return Err(ApiError::BadRequest(
            "no summary given and no model adapter configured".to_string(),
        ));
    };

    let context = history(
        handle,
        &HistoryOptions {
            can_alter_history: true,
            ..Default::default()
        },
    )?;
    let model = context
        .messages
        .iter()
        .rev()
        .find_map(|m| m.message.model.clone());
    let request = ModelRequest {
        session_id: handle.session_id().to_wire(),
        system_prompt: COMPRESSION_PROMPT.to_string(),
        context: context.messages,
        model,
        continuation_state: None,
    };

    let (tx, mut rx) = mpsc::channel::<ProviderEvent>(64);
    let cancel = CancellationToken::new();
    let generate = tokio::spawn(async move { provider.generate(request, tx, cancel).await });

    let mut summary = String::new();
    while let Some(event) = rx.recv().await {
        if let ProviderEvent::Text(chunk) = event {
            summary.push_str(&chunk);
        }
    }
    match generate.await {
        Ok(Ok(())) if !summary.trim().is_empty() => Ok(summary),
        Ok(Ok(())) => Err(ApiError::Internal("summarizer returned no text".to_string())),
        Ok(Err(err)) => Err(ApiError::Internal(err.to_string())),
        Err(join_err) => Err(ApiError::Internal(format!("summarizer task failed: {join_err}"))),
    }
}

/// The inline-data path needs a model message to hang attachments on, even
/// when no text chunk arrived yet.
fn ensure_model_message(
    handle: &SessionHandle,
    call: &Arc<ActiveCall>,
    segment: &mut Segment,
    acked: &mut bool,
) -> ApiResult<i64> {
    if let Some(id) = segment.model_id {
        return Ok(id);
    }
    let message =
        handle.transaction(|tx| append_message(tx, call.branch_id, &NewMessage::model("")))?;
    segment.model_id = Some(message.id);
    segment.model_text = String::new();
    if !*acked {
        *acked = true;
        call.send(StreamEvent::Acknowledge {
            temp_id: None,
            message_id: message.id,
        });
    }
    Ok(message.id)
}
