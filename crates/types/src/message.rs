// crates/types/src/message.rs
//! Message rows, attachments, and the branch-alternative surface.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// The role/kind of a message row.
///
/// Stored as lowercase snake_case text in the `messages.type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Model,
    Thought,
    FunctionCall,
    FunctionResponse,
    ModelError,
    /// Carries `"<lastIncludedID>\n<summary>"`; replaces earlier LLM context.
    Compression,
    /// In-band user command such as `clear` or `clearblobs`.
    Command,
    EnvChanged,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::User => "user",
            MessageType::Model => "model",
            MessageType::Thought => "thought",
            MessageType::FunctionCall => "function_call",
            MessageType::FunctionResponse => "function_response",
            MessageType::ModelError => "model_error",
            MessageType::Compression => "compression",
            MessageType::Command => "command",
            MessageType::EnvChanged => "env_changed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "user" => MessageType::User,
            "model" => MessageType::Model,
            "thought" => MessageType::Thought,
            "function_call" => MessageType::FunctionCall,
            "function_response" => MessageType::FunctionResponse,
            "model_error" => MessageType::ModelError,
            "compression" => MessageType::Compression,
            "command" => MessageType::Command,
            "env_changed" => MessageType::EnvChanged,
            _ => return None,
        })
    }

    /// Whether rows of this type are projected into the catalog's search
    /// tables by the session watcher.
    pub fn is_searchable(&self) -> bool {
        matches!(self, MessageType::User | MessageType::Model)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A blob reference carried by a message.
///
/// The blob data itself lives in the session DB's `blobs` table keyed by the
/// SHA-512/256 hash. `omitted` is set when a `clearblobs` command upstream has
/// removed the content from the LLM context (the row itself is kept).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub omitted: bool,
}

impl Attachment {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            mime_type: None,
            file_name: None,
            omitted: false,
        }
    }
}

/// One row of the per-session `messages` table.
///
/// `id` is only unique within its session DB. `chosen_next_id` picks the
/// "current" continuation among this message's children; siblings of the
/// chosen child are the alternative branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub branch_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_next_id: Option<i64>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumul_token_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub generation: i64,
    /// Opaque provider continuation token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Internal metadata, free-form JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<serde_json::Value>,
    #[ts(type = "number")]
    pub created_at: i64,
}

impl Message {
    /// Parse a compression message's `"<lastIncludedID>\n<summary>"` text.
    pub fn compression_parts(&self) -> Option<(i64, &str)> {
        if self.message_type != MessageType::Compression {
            return None;
        }
        let (id, summary) = crate::event::split_once_newline(&self.text);
        id.parse::<i64>().ok().map(|id| (id, summary))
    }
}

/// An alternative continuation of some parent message, surfaced to clients
/// as the "other branches" affordance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(rename_all = "camelCase")]
pub struct BranchChoice {
    pub message_id: i64,
    pub branch_id: i64,
    /// Leading text of the sibling, for display in the branch picker.
    pub user_text: String,
    #[ts(type = "number")]
    pub timestamp: i64,
}

/// A message plus the sibling set computed by the history walker.
///
/// `possible_branches` never contains the message's own id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_branches: Vec<BranchChoice>,
}

/// Body of `POST /api/sessions/{id}/messages`.
///
/// One endpoint serves send, edit, retry, and continue; the `kind` tag
/// distinguishes them. Edit and retry target an existing message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SendMessageRequest {
    #[serde(rename_all = "camelCase")]
    Send {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
        /// Client-side optimistic id, echoed back in the `A` event.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Edit {
        message_id: i64,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    #[serde(rename_all = "camelCase")]
    Retry {
        message_id: i64,
    },
    Continue,
}
