// crates/types/src/event.rs
//! The streaming wire protocol.
//!
//! Each event is `<tag>\n<body>` where `<tag>` is a single character and the
//! body may itself contain `\n`-separated fields. Both sides split on the
//! *first* newline only; trailing fields are free to contain newlines, so a
//! multi-field body is decoded front-to-back with [`split_once_newline`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

use crate::message::HistoryMessage;
use crate::session::{SessionMeta, Workspace};

/// Split a string at the first `\n`. The second half keeps any further
/// newlines intact. Returns `(s, "")` when there is no newline.
pub fn split_once_newline(s: &str) -> (&str, &str) {
    match s.split_once('\n') {
        Some((head, tail)) => (head, tail),
        None => (s, ""),
    }
}

/// The JSON payload of the `I`/`i` events that open a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(rename_all = "camelCase")]
pub struct InitialState {
    pub session: SessionMeta,
    pub system_prompt: String,
    pub history: Vec<HistoryMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<Workspace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_branch_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_confirmation: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_changed: Option<serde_json::Value>,
    /// Present when a model call is already in flight for this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_elapsed_time_seconds: Option<f64>,
    pub has_more: bool,
}

/// A decoded stream event.
///
/// The `I`/`i` distinction (call in flight vs. not) is carried by
/// `call_active`; `i` tells the client the stream will close right after.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// `I` / `i` — opens the stream with the full session state.
    Initial {
        state: Box<InitialState>,
        call_active: bool,
    },
    /// `W` — workspace id hint sent before `I` so the sidebar can render.
    WorkspaceHint { workspace_id: String },
    /// `A` — binds a client temp id (when present) to an authoritative id.
    Acknowledge {
        temp_id: Option<String>,
        message_id: i64,
    },
    /// `m` — append text to a model message, creating it client-side if new.
    ModelText { message_id: i64, text: String },
    /// `t` — thought chunk.
    Thought { message_id: i64, text: String },
    /// `f` — function call with JSON args.
    FunctionCall {
        message_id: i64,
        name: String,
        args: String,
    },
    /// `r` — function response; payload is `{response, attachments}` JSON.
    FunctionResponse {
        message_id: i64,
        name: String,
        payload: String,
    },
    /// `d` — inline (non-text) model data, JSON `{messageID, attachments}`.
    InlineData { payload: String },
    /// `T` — cumulative token count update.
    TokenCount { message_id: i64, count: i64 },
    /// `C` — pending tool confirmation, JSON blob.
    PendingConfirmation { payload: String },
    /// `G` — environment change, JSON blob.
    EnvChanged { payload: String },
    /// `N` — session renamed.
    SessionRenamed { session_id: String, name: String },
    /// `P` — keep-alive.
    Ping,
    /// `E` — error text; the stream closes after this event.
    Error { message: String },
    /// `D` — normal completion; the stream closes.
    Done,
    /// `F` — stream finished, no further events.
    Finished,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventParseError {
    #[error("empty event")]
    Empty,
    #[error("unknown event tag {0:?}")]
    UnknownTag(String),
    #[error("malformed {tag} body: {reason}")]
    MalformedBody { tag: char, reason: String },
}

impl StreamEvent {
    pub fn tag(&self) -> char {
        match self {
            StreamEvent::Initial { call_active: true, .. } => 'I',
            StreamEvent::Initial { call_active: false, .. } => 'i',
            StreamEvent::WorkspaceHint { .. } => 'W',
            StreamEvent::Acknowledge { .. } => 'A',
            StreamEvent::ModelText { .. } => 'm',
            StreamEvent::Thought { .. } => 't',
            StreamEvent::FunctionCall { .. } => 'f',
            StreamEvent::FunctionResponse { .. } => 'r',
            StreamEvent::InlineData { .. } => 'd',
            StreamEvent::TokenCount { .. } => 'T',
            StreamEvent::PendingConfirmation { .. } => 'C',
            StreamEvent::EnvChanged { .. } => 'G',
            StreamEvent::SessionRenamed { .. } => 'N',
            StreamEvent::Ping => 'P',
            StreamEvent::Error { .. } => 'E',
            StreamEvent::Done => 'D',
            StreamEvent::Finished => 'F',
        }
    }

    /// Whether the stream terminates after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Initial { call_active: false, .. }
                | StreamEvent::Error { .. }
                | StreamEvent::Done
                | StreamEvent::Finished
        )
    }

    /// Encode to the `<tag>\n<body>` wire form. Body-less events encode as
    /// the bare tag.
    pub fn encode(&self) -> String {
        let tag = self.tag();
        match self {
            StreamEvent::Initial { state, .. } => {
                let json = serde_json::to_string(state).unwrap_or_else(|_| "{}".to_string());
                format!("{tag}\n{json}")
            }
            StreamEvent::WorkspaceHint { workspace_id } => format!("{tag}\n{workspace_id}"),
            StreamEvent::Acknowledge { temp_id, message_id } => match temp_id {
                Some(temp) => format!("{tag}\n{temp}\n{message_id}"),
                None => format!("{tag}\n{message_id}"),
            },
            StreamEvent::ModelText { message_id, text }
            | StreamEvent::Thought { message_id, text } => {
                format!("{tag}\n{message_id}\n{text}")
            }
            StreamEvent::FunctionCall { message_id, name, args } => {
                format!("{tag}\n{message_id}\n{name}\n{args}")
            }
            StreamEvent::FunctionResponse { message_id, name, payload } => {
                format!("{tag}\n{message_id}\n{name}\n{payload}")
            }
            StreamEvent::InlineData { payload }
            | StreamEvent::PendingConfirmation { payload }
            | StreamEvent::EnvChanged { payload } => format!("{tag}\n{payload}"),
            StreamEvent::TokenCount { message_id, count } => {
                format!("{tag}\n{message_id}\n{count}")
            }
            StreamEvent::SessionRenamed { session_id, name } => {
                format!("{tag}\n{session_id}\n{name}")
            }
            StreamEvent::Ping | StreamEvent::Done | StreamEvent::Finished => tag.to_string(),
            StreamEvent::Error { message } => format!("{tag}\n{message}"),
        }
    }

    /// Decode a wire event. The inverse of [`StreamEvent::encode`].
    pub fn decode(raw: &str) -> Result<Self, EventParseError> {
        if raw.is_empty() {
            return Err(EventParseError::Empty);
        }
        let (tag_str, body) = split_once_newline(raw);
        let mut chars = tag_str.chars();
        let tag = chars.next().ok_or(EventParseError::Empty)?;
        if chars.next().is_some() {
            return Err(EventParseError::UnknownTag(tag_str.to_string()));
        }

        let parse_id = |s: &str| -> Result<i64, EventParseError> {
            s.parse::<i64>().map_err(|_| EventParseError::MalformedBody {
                tag,
                reason: format!("bad message id {s:?}"),
            })
        };

        match tag {
            'I' | 'i' => {
                let state: InitialState =
                    serde_json::from_str(body).map_err(|e| EventParseError::MalformedBody {
                        tag,
                        reason: e.to_string(),
                    })?;
                Ok(StreamEvent::Initial {
                    state: Box::new(state),
                    call_active: tag == 'I',
                })
            }
            'W' => Ok(StreamEvent::WorkspaceHint {
                workspace_id: body.to_string(),
            }),
            'A' => {
                // Either `messageID` or `tempID\nmessageID`.
                let (first, rest) = split_once_newline(body);
                if rest.is_empty() {
                    Ok(StreamEvent::Acknowledge {
                        temp_id: None,
                        message_id: parse_id(first)?,
                    })
                } else {
                    Ok(StreamEvent::Acknowledge {
                        temp_id: Some(first.to_string()),
                        message_id: parse_id(rest)?,
                    })
                }
            }
            'm' | 't' => {
                let (id, text) = split_once_newline(body);
                let message_id = parse_id(id)?;
                let text = text.to_string();
                Ok(if tag == 'm' {
                    StreamEvent::ModelText { message_id, text }
                } else {
                    StreamEvent::Thought { message_id, text }
                })
            }
            'f' | 'r' => {
                let (id, rest) = split_once_newline(body);
                let message_id = parse_id(id)?;
                let (name, payload) = split_once_newline(rest);
                let name = name.to_string();
                let payload = payload.to_string();
                Ok(if tag == 'f' {
                    StreamEvent::FunctionCall { message_id, name, args: payload }
                } else {
                    StreamEvent::FunctionResponse { message_id, name, payload }
                })
            }
            'd' => Ok(StreamEvent::InlineData { payload: body.to_string() }),
            'T' => {
                let (id, count) = split_once_newline(body);
                Ok(StreamEvent::TokenCount {
                    message_id: parse_id(id)?,
                    count: parse_id(count)?,
                })
            }
            'C' => Ok(StreamEvent::PendingConfirmation { payload: body.to_string() }),
            'G' => Ok(StreamEvent::EnvChanged { payload: body.to_string() }),
            'N' => {
                let (session_id, name) = split_once_newline(body);
                Ok(StreamEvent::SessionRenamed {
                    session_id: session_id.to_string(),
                    name: name.to_string(),
                })
            }
            'P' => Ok(StreamEvent::Ping),
            'E' => Ok(StreamEvent::Error { message: body.to_string() }),
            'D' => Ok(StreamEvent::Done),
            'F' => Ok(StreamEvent::Finished),
            other => Err(EventParseError::UnknownTag(other.to_string())),
        }
    }
}
