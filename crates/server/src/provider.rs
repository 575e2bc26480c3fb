// crates/server/src/provider.rs
//! The seam to LLM provider adapters.
//!
//! Adapters themselves are out of scope; the dispatcher consumes this trait
//! and turns provider events into persisted messages and wire events. Tests
//! drive the dispatcher with scripted providers.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use angel_types::{Attachment, HistoryMessage};

/// Events a provider pushes while a call is in flight.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Append a chunk of model text.
    Text(String),
    /// Append a chunk of thinking text.
    Thought(String),
    /// The model invoked a tool.
    FunctionCall { name: String, args_json: String },
    /// A tool produced a response payload (`{response, attachments}` JSON).
    FunctionResponse { name: String, payload_json: String },
    /// Non-text inline output.
    InlineData { attachments: Vec<Attachment> },
    /// Cumulative token count for the call so far.
    TokenCount(i64),
    /// A tool paused for approval; the blob is stored on the branch and the
    /// call ends until the client confirms.
    PendingConfirmation(String),
}

/// What the dispatcher hands to an adapter.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub session_id: String,
    pub system_prompt: String,
    /// Effective LLM context (compression and `clear` already applied).
    pub context: Vec<HistoryMessage>,
    pub model: Option<String>,
    /// Opaque continuation token from the last model message, if any.
    pub continuation_state: Option<String>,
}

#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    /// Run one model call, pushing incremental events into `events`. A
    /// clean return completes the call; an error becomes a `model_error`
    /// message and an `E` wire event. Implementations observe `cancel`.
    async fn generate(
        &self,
        request: ModelRequest,
        events: mpsc::Sender<ProviderEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}
