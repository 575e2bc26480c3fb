// crates/session/src/fsm.rs
//! The session reducer.
//!
//! States are `no_session`, `session_loading`, `session_ready`,
//! `session_error`, with an orthogonal active-operation flag. Actions come
//! from the URL, user input, and the server's event stream; the reducer
//! mutates the state and returns the effects (loads, stream opens, fetches)
//! the host should run. Optimistic updates land in the message list before
//! the effect that submits them.

use angel_types::{
    Attachment, BranchChoice, HistoryMessage, InitialState, MessageType, StreamEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    NoSession,
    SessionLoading,
    SessionReady,
    SessionError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveOperation {
    #[default]
    None,
    Loading,
    Sending,
    Streaming,
}

/// Client-side message identity: a temporary UUID until the server's `A`
/// event binds the authoritative row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageId {
    Temp(String),
    Real(i64),
}

impl MessageId {
    pub fn real(&self) -> Option<i64> {
        match self {
            MessageId::Real(id) => Some(*id),
            MessageId::Temp(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub message_type: MessageType,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub possible_branches: Vec<BranchChoice>,
    pub token_count: Option<i64>,
    /// Tool name for function_call / function_response rows.
    pub tool_name: Option<String>,
}

impl ChatMessage {
    fn from_history(hm: HistoryMessage) -> Self {
        let tool_name = hm
            .message
            .aux
            .as_ref()
            .and_then(|aux| aux.get("name"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Self {
            id: MessageId::Real(hm.message.id),
            message_type: hm.message.message_type,
            text: hm.message.text,
            attachments: hm.message.attachments,
            possible_branches: hm.possible_branches,
            token_count: hm.message.cumul_token_count,
            tool_name,
        }
    }

    fn streamed(id: i64, message_type: MessageType, text: String) -> Self {
        Self {
            id: MessageId::Real(id),
            message_type,
            text,
            attachments: Vec::new(),
            possible_branches: Vec::new(),
            token_count: None,
            tool_name: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub session_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub has_more: bool,
    pub active_operation: ActiveOperation,
    /// Single-slot register: the old id an edit/retry removed, consumed by
    /// the next bare `A` event.
    pub pending_rebind: Option<MessageId>,
    pub pending_confirmation: Option<serde_json::Value>,
    pub env_changed: Option<serde_json::Value>,
    pub input: String,
    pub workspace_hint: Option<String>,
    pub session_name: Option<String>,
    pub error: Option<String>,
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        self.phase = phase;
    }

    /// An `E`-derived error message is retryable only while it is the last
    /// message in the list; older errors have been continued past.
    pub fn is_retryable_error(&self, index: usize) -> bool {
        self.messages
            .get(index)
            .map(|m| m.message_type == MessageType::ModelError)
            .unwrap_or(false)
            && index + 1 == self.messages.len()
    }

    fn find_real_mut(&mut self, id: i64) -> Option<&mut ChatMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.id == MessageId::Real(id))
    }

    fn reset_chat(&mut self) {
        self.messages.clear();
        self.has_more = false;
        self.pending_rebind = None;
        self.pending_confirmation = None;
        self.active_operation = ActiveOperation::None;
        self.session_name = None;
        self.error = None;
    }
}

#[derive(Debug)]
pub enum Action {
    /// The URL changed; `None` means the new-session route.
    UrlChanged { session_id: Option<String> },
    SessionLoaded { initial: Box<InitialState> },
    StreamStarted,
    StreamCompleted,
    EarlierMessagesLoading,
    EarlierMessagesLoaded {
        messages: Vec<HistoryMessage>,
        has_more: bool,
    },
    ErrorOccurred { message: String },
    InputChanged { text: String },
    /// Optimistically push the composer text as a user message.
    SendMessage,
    /// Slice the list at `index`, replacing that message's text.
    EditMessage { index: usize, text: String },
    /// Slice the list at `index` to regenerate the model message there.
    RetryMessage { index: usize },
    LoadEarlier,
    /// An event arrived on the open stream.
    ServerEvent { event: StreamEvent },
    /// The operation manager aborted the stream (escape-escape).
    StreamCancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open the session's event stream (which replays history as `I`/`i`).
    LoadSession { session_id: String },
    CloseStream,
    SubmitSend {
        session_id: String,
        temp_id: String,
        text: String,
    },
    SubmitEdit {
        session_id: String,
        message_id: i64,
        text: String,
    },
    SubmitRetry {
        session_id: String,
        message_id: i64,
    },
    LoadEarlier {
        session_id: String,
        before: i64,
    },
    /// Hit the dedicated cancel endpoint (escape-escape).
    CancelCall { session_id: String },
}

pub fn reduce(state: &mut SessionState, action: Action) -> Vec<Effect> {
    match action {
        Action::UrlChanged { session_id } => url_changed(state, session_id),
        Action::SessionLoaded { initial } => {
            apply_initial(state, *initial, false);
            Vec::new()
        }
        Action::StreamStarted => {
            state.active_operation = ActiveOperation::Streaming;
            Vec::new()
        }
        Action::StreamCompleted | Action::StreamCancelled => {
            state.active_operation = ActiveOperation::None;
            Vec::new()
        }
        Action::EarlierMessagesLoading => {
            state.active_operation = ActiveOperation::Loading;
            Vec::new()
        }
        Action::EarlierMessagesLoaded { messages, has_more } => {
            let older: Vec<ChatMessage> =
                messages.into_iter().map(ChatMessage::from_history).collect();
            state.messages.splice(0..0, older);
            state.has_more = has_more;
            state.active_operation = ActiveOperation::None;
            Vec::new()
        }
        Action::ErrorOccurred { message } => {
            state.set_phase(SessionPhase::SessionError);
            state.error = Some(message);
            Vec::new()
        }
        Action::InputChanged { text } => {
            state.input = text;
            Vec::new()
        }
        Action::SendMessage => send_message(state),
        Action::EditMessage { index, text } => edit_message(state, index, text),
        Action::RetryMessage { index } => retry_message(state, index),
        Action::LoadEarlier => load_earlier(state),
        Action::ServerEvent { event } => server_event(state, event),
    }
}

fn url_changed(state: &mut SessionState, session_id: Option<String>) -> Vec<Effect> {
    match session_id {
        None => {
            // New-session route: only an established session has chat state
            // to reset; from no_session this is a no-op.
            if state.phase() == SessionPhase::NoSession {
                return Vec::new();
            }
            *state = SessionState::default();
            vec![Effect::CloseStream]
        }
        Some(id) => {
            if state.session_id.as_deref() == Some(id.as_str()) {
                return Vec::new();
            }
            if !matches!(
                state.phase(),
                SessionPhase::NoSession | SessionPhase::SessionReady | SessionPhase::SessionError
            ) {
                return Vec::new();
            }
            state.reset_chat();
            state.session_id = Some(id.clone());
            state.set_phase(SessionPhase::SessionLoading);
            vec![Effect::CloseStream, Effect::LoadSession { session_id: id }]
        }
    }
}

fn apply_initial(state: &mut SessionState, initial: InitialState, call_active: bool) {
    state.set_phase(SessionPhase::SessionReady);
    state.messages = initial
        .history
        .into_iter()
        .map(ChatMessage::from_history)
        .collect();
    state.has_more = initial.has_more;
    state.pending_confirmation = initial.pending_confirmation;
    state.session_name = Some(initial.session.name.clone());
    state.session_id = Some(initial.session.id);
    state.active_operation = if call_active {
        ActiveOperation::Streaming
    } else {
        ActiveOperation::None
    };
    state.error = None;
}

fn send_message(state: &mut SessionState) -> Vec<Effect> {
    if state.phase() != SessionPhase::SessionReady || state.input.trim().is_empty() {
        return Vec::new();
    }
    let Some(session_id) = state.session_id.clone() else {
        return Vec::new();
    };
    let temp_id = uuid::Uuid::new_v4().to_string();
    let text = std::mem::take(&mut state.input);
    state.messages.push(ChatMessage {
        id: MessageId::Temp(temp_id.clone()),
        message_type: MessageType::User,
        text: text.clone(),
        attachments: Vec::new(),
        possible_branches: Vec::new(),
        token_count: None,
        tool_name: None,
    });
    state.active_operation = ActiveOperation::Sending;
    vec![Effect::SubmitSend {
        session_id,
        temp_id,
        text,
    }]
}

fn edit_message(state: &mut SessionState, index: usize, text: String) -> Vec<Effect> {
    let Some(session_id) = state.session_id.clone() else {
        return Vec::new();
    };
    let Some(original_id) = state.messages.get(index).and_then(|m| m.id.real()) else {
        return Vec::new();
    };
    // Slice forward from the target; the edited message stays, showing the
    // new text under its old id until the `A` event rebinds it.
    state.messages.truncate(index + 1);
    if let Some(message) = state.messages.get_mut(index) {
        message.text = text.clone();
        message.possible_branches.clear();
    }
    state.pending_rebind = Some(MessageId::Real(original_id));
    state.active_operation = ActiveOperation::Sending;
    vec![Effect::SubmitEdit {
        session_id,
        message_id: original_id,
        text,
    }]
}

fn retry_message(state: &mut SessionState, index: usize) -> Vec<Effect> {
    let Some(session_id) = state.session_id.clone() else {
        return Vec::new();
    };
    let Some(original_id) = state.messages.get(index).and_then(|m| m.id.real()) else {
        return Vec::new();
    };
    // Remove the regenerated message and everything after it; the
    // replacement arrives through the stream with a fresh id.
    state.messages.truncate(index);
    state.pending_rebind = Some(MessageId::Real(original_id));
    state.active_operation = ActiveOperation::Sending;
    vec![Effect::SubmitRetry {
        session_id,
        message_id: original_id,
    }]
}

fn load_earlier(state: &mut SessionState) -> Vec<Effect> {
    if !state.has_more || state.active_operation != ActiveOperation::None {
        return Vec::new();
    }
    let (Some(session_id), Some(before)) = (
        state.session_id.clone(),
        state.messages.iter().find_map(|m| m.id.real()),
    ) else {
        return Vec::new();
    };
    state.active_operation = ActiveOperation::Loading;
    vec![Effect::LoadEarlier { session_id, before }]
}

fn server_event(state: &mut SessionState, event: StreamEvent) -> Vec<Effect> {
    match event {
        StreamEvent::Initial { state: initial, call_active } => {
            apply_initial(state, *initial, call_active);
        }
        StreamEvent::WorkspaceHint { workspace_id } => {
            state.workspace_hint = Some(workspace_id);
        }
        StreamEvent::Acknowledge { temp_id, message_id } => {
            acknowledge(state, temp_id, message_id);
        }
        StreamEvent::ModelText { message_id, text } => {
            append_streamed(state, message_id, MessageType::Model, text);
            state.active_operation = ActiveOperation::Streaming;
        }
        StreamEvent::Thought { message_id, text } => {
            append_streamed(state, message_id, MessageType::Thought, text);
            state.active_operation = ActiveOperation::Streaming;
        }
        StreamEvent::FunctionCall { message_id, name, args } => {
            let mut message =
                ChatMessage::streamed(message_id, MessageType::FunctionCall, args);
            message.tool_name = Some(name);
            upsert_streamed(state, message);
        }
        StreamEvent::FunctionResponse { message_id, name, payload } => {
            let mut message =
                ChatMessage::streamed(message_id, MessageType::FunctionResponse, payload);
            message.tool_name = Some(name);
            upsert_streamed(state, message);
        }
        StreamEvent::InlineData { payload } => {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&payload) {
                let id = value.get("messageID").and_then(|v| v.as_i64());
                let attachments = value
                    .get("attachments")
                    .and_then(|v| serde_json::from_value::<Vec<Attachment>>(v.clone()).ok());
                if let (Some(id), Some(attachments)) = (id, attachments) {
                    if let Some(message) = state.find_real_mut(id) {
                        message.attachments = attachments;
                    }
                }
            }
        }
        StreamEvent::TokenCount { message_id, count } => {
            if let Some(message) = state.find_real_mut(message_id) {
                message.token_count = Some(count);
            }
        }
        StreamEvent::PendingConfirmation { payload } => {
            state.pending_confirmation = serde_json::from_str(&payload).ok();
        }
        StreamEvent::EnvChanged { payload } => {
            state.env_changed = serde_json::from_str(&payload).ok();
        }
        StreamEvent::SessionRenamed { name, .. } => {
            state.session_name = Some(name);
        }
        StreamEvent::Ping => {}
        StreamEvent::Error { message } => {
            state.messages.push(ChatMessage {
                id: MessageId::Temp(uuid::Uuid::new_v4().to_string()),
                message_type: MessageType::ModelError,
                text: message,
                attachments: Vec::new(),
                possible_branches: Vec::new(),
                token_count: None,
                tool_name: None,
            });
            state.active_operation = ActiveOperation::None;
        }
        StreamEvent::Done => {
            state.active_operation = ActiveOperation::None;
        }
        StreamEvent::Finished => {
            state.active_operation = ActiveOperation::None;
            return vec![Effect::CloseStream];
        }
    }
    Vec::new()
}

fn acknowledge(state: &mut SessionState, temp_id: Option<String>, message_id: i64) {
    match temp_id {
        Some(temp) => {
            let target = MessageId::Temp(temp);
            if let Some(message) = state.messages.iter_mut().find(|m| m.id == target) {
                message.id = MessageId::Real(message_id);
            }
            state.active_operation = ActiveOperation::Streaming;
        }
        None => {
            // Consume the pending-rebind register; edit keeps the message in
            // place, retry removed it (nothing to rebind, the stream will
            // deliver the replacement).
            if let Some(old) = state.pending_rebind.take() {
                if let Some(message) = state.messages.iter_mut().find(|m| m.id == old) {
                    message.id = MessageId::Real(message_id);
                }
            }
            state.active_operation = ActiveOperation::Streaming;
        }
    }
}

fn append_streamed(state: &mut SessionState, id: i64, ty: MessageType, chunk: String) {
    match state.find_real_mut(id) {
        Some(message) => message.text.push_str(&chunk),
        None => state.messages.push(ChatMessage::streamed(id, ty, chunk)),
    }
}

fn upsert_streamed(state: &mut SessionState, message: ChatMessage) {
    let exists = state.messages.iter().any(|m| m.id == message.id);
    if !exists {
        state.messages.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use angel_types::{Message, SessionMeta};
    use pretty_assertions::assert_eq;

    fn initial_state(id: &str, history: Vec<HistoryMessage>) -> InitialState {
        InitialState {
            session: SessionMeta {
                id: id.to_string(),
                created_at: 0,
                last_updated_at: 0,
                system_prompt: String::new(),
                name: "chat".to_string(),
                workspace_id: None,
                primary_branch_id: Some(1),
                chosen_first_id: None,
            },
            system_prompt: String::new(),
            history,
            workspace: None,
            primary_branch_id: Some(1),
            pending_confirmation: None,
            env_changed: None,
            call_elapsed_time_seconds: None,
            has_more: false,
        }
    }

    fn history_message(id: i64, ty: MessageType, text: &str) -> HistoryMessage {
        HistoryMessage {
            message: Message {
                id,
                branch_id: 1,
                parent_message_id: None,
                chosen_next_id: None,
                message_type: ty,
                text: text.to_string(),
                attachments: vec![],
                cumul_token_count: None,
                model: None,
                generation: 0,
                state: None,
                aux: None,
                created_at: 0,
            },
            possible_branches: vec![],
        }
    }

    #[test]
    fn url_change_to_existing_session_loads() {
        let mut state = SessionState::default();
        let effects = reduce(
            &mut state,
            Action::UrlChanged {
                session_id: Some("AbCdEfGh".to_string()),
            },
        );
        assert_eq!(state.phase(), SessionPhase::SessionLoading);
        assert!(effects.contains(&Effect::CloseStream));
        assert!(effects.contains(&Effect::LoadSession {
            session_id: "AbCdEfGh".to_string()
        }));
    }

    #[test]
    fn url_change_to_same_session_is_noop() {
        let mut state = SessionState::default();
        reduce(&mut state, Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        reduce(
            &mut state,
            Action::SessionLoaded {
                initial: Box::new(initial_state("AbCdEfGh", vec![])),
            },
        );
        let effects = reduce(&mut state, Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        assert!(effects.is_empty());
        assert_eq!(state.phase(), SessionPhase::SessionReady);
    }

    #[test]
    fn new_session_url_from_no_session_is_noop() {
        let mut state = SessionState::default();
        let effects = reduce(&mut state, Action::UrlChanged { session_id: None });
        assert!(effects.is_empty());
        assert_eq!(state.phase(), SessionPhase::NoSession);
    }

    #[test]
    fn new_session_url_from_ready_resets() {
        let mut state = SessionState::default();
        reduce(&mut state, Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        reduce(
            &mut state,
            Action::SessionLoaded {
                initial: Box::new(initial_state(
                    "AbCdEfGh",
                    vec![history_message(1, MessageType::User, "hi")],
                )),
            },
        );
        let effects = reduce(&mut state, Action::UrlChanged { session_id: None });
        assert_eq!(effects, vec![Effect::CloseStream]);
        assert_eq!(state.phase(), SessionPhase::NoSession);
        assert!(state.messages.is_empty());
    }

    #[test]
    fn send_is_optimistic_before_submit() {
        let mut state = SessionState::default();
        reduce(&mut state, Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        reduce(
            &mut state,
            Action::SessionLoaded { initial: Box::new(initial_state("AbCdEfGh", vec![])) },
        );
        reduce(&mut state, Action::InputChanged { text: "hello".into() });

        let effects = reduce(&mut state, Action::SendMessage);
        // Optimistic push happened, input cleared, submit effect emitted.
        assert_eq!(state.messages.len(), 1);
        assert!(matches!(state.messages[0].id, MessageId::Temp(_)));
        assert!(state.input.is_empty());
        assert_eq!(state.active_operation, ActiveOperation::Sending);
        assert!(matches!(effects[0], Effect::SubmitSend { .. }));
    }

    #[test]
    fn acknowledge_rebinds_temp_id() {
        let mut state = SessionState::default();
        reduce(&mut state, Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        reduce(
            &mut state,
            Action::SessionLoaded { initial: Box::new(initial_state("AbCdEfGh", vec![])) },
        );
        reduce(&mut state, Action::InputChanged { text: "hello".into() });
        reduce(&mut state, Action::SendMessage);
        let temp = match &state.messages[0].id {
            MessageId::Temp(t) => t.clone(),
            other => panic!("expected temp id, got {other:?}"),
        };

        reduce(
            &mut state,
            Action::ServerEvent {
                event: StreamEvent::Acknowledge { temp_id: Some(temp), message_id: 7 },
            },
        );
        assert_eq!(state.messages[0].id, MessageId::Real(7));
    }

    #[test]
    fn edit_slices_and_uses_rebind_register() {
        let mut state = SessionState::default();
        reduce(&mut state, Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        reduce(
            &mut state,
            Action::SessionLoaded {
                initial: Box::new(initial_state(
                    "AbCdEfGh",
                    vec![
                        history_message(1, MessageType::User, "a"),
                        history_message(2, MessageType::Model, "b"),
                        history_message(3, MessageType::User, "c"),
                        history_message(4, MessageType::Model, "d"),
                    ],
                )),
            },
        );

        let effects = reduce(&mut state, Action::EditMessage { index: 0, text: "a2".into() });
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].text, "a2");
        assert_eq!(state.pending_rebind, Some(MessageId::Real(1)));
        assert!(matches!(
            effects[0],
            Effect::SubmitEdit { message_id: 1, .. }
        ));

        // Bare `A` consumes the register and rebinds in place.
        reduce(
            &mut state,
            Action::ServerEvent {
                event: StreamEvent::Acknowledge { temp_id: None, message_id: 9 },
            },
        );
        assert_eq!(state.messages[0].id, MessageId::Real(9));
        assert!(state.pending_rebind.is_none());
    }

    #[test]
    fn retry_slices_away_the_target() {
        let mut state = SessionState::default();
        reduce(&mut state, Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        reduce(
            &mut state,
            Action::SessionLoaded {
                initial: Box::new(initial_state(
                    "AbCdEfGh",
                    vec![
                        history_message(1, MessageType::User, "a"),
                        history_message(2, MessageType::Model, "b"),
                    ],
                )),
            },
        );
        let effects = reduce(&mut state, Action::RetryMessage { index: 1 });
        assert_eq!(state.messages.len(), 1);
        assert!(matches!(effects[0], Effect::SubmitRetry { message_id: 2, .. }));

        // The regenerated message streams in under a new id.
        reduce(
            &mut state,
            Action::ServerEvent {
                event: StreamEvent::ModelText { message_id: 10, text: "b2".into() },
            },
        );
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].id, MessageId::Real(10));
        assert_eq!(state.messages[1].text, "b2");
    }

    #[test]
    fn model_text_chunks_accumulate() {
        let mut state = SessionState::default();
        reduce(&mut state, Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        reduce(
            &mut state,
            Action::SessionLoaded { initial: Box::new(initial_state("AbCdEfGh", vec![])) },
        );
        for chunk in ["hel", "lo ", "world"] {
            reduce(
                &mut state,
                Action::ServerEvent {
                    event: StreamEvent::ModelText { message_id: 5, text: chunk.into() },
                },
            );
        }
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].text, "hello world");
        assert_eq!(state.active_operation, ActiveOperation::Streaming);
    }

    #[test]
    fn error_event_is_retryable_only_as_last_message() {
        let mut state = SessionState::default();
        reduce(&mut state, Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        reduce(
            &mut state,
            Action::SessionLoaded { initial: Box::new(initial_state("AbCdEfGh", vec![])) },
        );
        reduce(
            &mut state,
            Action::ServerEvent { event: StreamEvent::Error { message: "boom".into() } },
        );
        assert!(state.is_retryable_error(0));

        reduce(
            &mut state,
            Action::ServerEvent {
                event: StreamEvent::ModelText { message_id: 6, text: "recovered".into() },
            },
        );
        assert!(!state.is_retryable_error(0));
    }

    #[test]
    fn stream_lifecycle_toggles_active_operation() {
        let mut state = SessionState::default();
        reduce(&mut state, Action::StreamStarted);
        assert_eq!(state.active_operation, ActiveOperation::Streaming);
        reduce(&mut state, Action::StreamCompleted);
        assert_eq!(state.active_operation, ActiveOperation::None);

        reduce(&mut state, Action::EarlierMessagesLoading);
        assert_eq!(state.active_operation, ActiveOperation::Loading);
        reduce(
            &mut state,
            Action::EarlierMessagesLoaded { messages: vec![], has_more: false },
        );
        assert_eq!(state.active_operation, ActiveOperation::None);
    }

    #[test]
    fn earlier_messages_prepend() {
        let mut state = SessionState::default();
        reduce(&mut state, Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        reduce(
            &mut state,
            Action::SessionLoaded {
                initial: Box::new({
                    let mut init = initial_state(
                        "AbCdEfGh",
                        vec![history_message(10, MessageType::User, "recent")],
                    );
                    init.has_more = true;
                    init
                }),
            },
        );

        let effects = reduce(&mut state, Action::LoadEarlier);
        assert_eq!(
            effects,
            vec![Effect::LoadEarlier { session_id: "AbCdEfGh".into(), before: 10 }]
        );

        reduce(&mut state, Action::EarlierMessagesLoading);
        reduce(
            &mut state,
            Action::EarlierMessagesLoaded {
                messages: vec![history_message(4, MessageType::User, "older")],
                has_more: false,
            },
        );
        assert_eq!(state.messages[0].id, MessageId::Real(4));
        assert_eq!(state.messages[1].id, MessageId::Real(10));
        assert!(!state.has_more);
    }

    #[test]
    fn finished_event_closes_the_stream() {
        let mut state = SessionState::default();
        let effects = reduce(
            &mut state,
            Action::ServerEvent { event: StreamEvent::Finished },
        );
        assert_eq!(effects, vec![Effect::CloseStream]);
    }
}
