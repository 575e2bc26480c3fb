// crates/session/src/client.rs
//! Glue between the reducer, the operation manager, and the host's network
//! layer. The host implements [`Transport`] (an `EventSource` opener plus a
//! fetch runner) and feeds server events back through [`SessionClient::dispatch`];
//! everything else — closing stale streams, the escape-escape chord, the
//! cancel endpoint — is handled here.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::fsm::{reduce, Action, Effect, SessionState};
use crate::ops::{OperationManager, StreamHandle};

/// The host-provided network seam.
pub trait Transport {
    /// Open the session event stream. The returned handle must close the
    /// underlying connection when asked; `abort` cancels any fetch the
    /// transport couples to the stream.
    fn open_stream(&mut self, session_id: &str, abort: CancellationToken) -> Box<dyn StreamHandle>;

    /// Run a fire-and-forget request (message submit, pagination, cancel).
    /// Responses come back as dispatched actions.
    fn request(&mut self, effect: Effect);
}

pub struct SessionClient<T: Transport> {
    state: SessionState,
    ops: OperationManager,
    transport: T,
}

impl<T: Transport> SessionClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            state: SessionState::default(),
            ops: OperationManager::new(),
            transport,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn has_active_stream(&self) -> bool {
        self.ops.has_active_stream()
    }

    /// Run an action through the reducer and execute the resulting effects.
    pub fn dispatch(&mut self, action: Action) {
        let effects = reduce(&mut self.state, action);
        for effect in effects {
            self.apply(effect);
        }
    }

    /// Register an Escape press; the second press within the chord window
    /// aborts the active stream, hits the cancel endpoint, and resets the
    /// active operation while keeping all received messages.
    pub fn on_escape(&mut self, now: Instant) -> bool {
        if !self.ops.on_escape(now) {
            return false;
        }
        if let Some(session_id) = self.state.session_id.clone() {
            self.transport.request(Effect::CancelCall { session_id });
        }
        self.dispatch(Action::StreamCancelled);
        true
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::LoadSession { session_id } => {
                let abort = CancellationToken::new();
                let stream = self.transport.open_stream(&session_id, abort.clone());
                // Installing the new pair closes any previous stream.
                self.ops.open_stream(stream, abort);
            }
            Effect::CloseStream => self.ops.close_stream(),
            other => self.transport.request(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{ActiveOperation, MessageId, SessionPhase};
    use angel_types::{HistoryMessage, InitialState, Message, MessageType, SessionMeta, StreamEvent};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct RecordingStream {
        closed: Arc<AtomicBool>,
    }

    impl StreamHandle for RecordingStream {
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        opened: Vec<String>,
        requests: Vec<Effect>,
        stream_closed: Vec<Arc<AtomicBool>>,
    }

    impl Transport for RecordingTransport {
        fn open_stream(
            &mut self,
            session_id: &str,
            _abort: CancellationToken,
        ) -> Box<dyn StreamHandle> {
            self.opened.push(session_id.to_string());
            let closed = Arc::new(AtomicBool::new(false));
            self.stream_closed.push(closed.clone());
            Box::new(RecordingStream { closed })
        }

        fn request(&mut self, effect: Effect) {
            self.requests.push(effect);
        }
    }

    fn initial(id: &str, history: Vec<HistoryMessage>, call_active: bool) -> Action {
        let state = InitialState {
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
        };
        Action::ServerEvent {
            event: StreamEvent::Initial {
                state: Box::new(state),
                call_active,
            },
        }
    }

    fn message(id: i64, text: &str) -> HistoryMessage {
        HistoryMessage {
            message: Message {
                id,
                branch_id: 1,
                parent_message_id: None,
                chosen_next_id: None,
                message_type: MessageType::User,
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
    fn navigation_opens_and_replaces_streams() {
        let mut client = SessionClient::new(RecordingTransport::default());

        client.dispatch(Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        assert_eq!(client.transport.opened, vec!["AbCdEfGh"]);
        assert!(client.has_active_stream());

        // Navigating to another session closes the first stream.
        client.dispatch(Action::UrlChanged { session_id: Some("ZyXwVuTs".into()) });
        assert_eq!(client.transport.opened.len(), 2);
        assert!(client.transport.stream_closed[0].load(Ordering::SeqCst));
        assert!(!client.transport.stream_closed[1].load(Ordering::SeqCst));
    }

    #[test]
    fn send_routes_through_the_transport() {
        let mut client = SessionClient::new(RecordingTransport::default());
        client.dispatch(Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        client.dispatch(initial("AbCdEfGh", vec![], false));
        client.dispatch(Action::InputChanged { text: "hello".into() });
        client.dispatch(Action::SendMessage);

        assert!(matches!(
            client.transport.requests.last(),
            Some(Effect::SubmitSend { .. })
        ));
        assert_eq!(client.state().messages.len(), 1);
    }

    #[test]
    fn escape_escape_cancels_the_call_and_keeps_messages() {
        // Two Escape presses 300 ms apart during a streaming call.
        let mut client = SessionClient::new(RecordingTransport::default());
        client.dispatch(Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        client.dispatch(initial("AbCdEfGh", vec![message(1, "question")], true));
        client.dispatch(Action::ServerEvent {
            event: StreamEvent::ModelText { message_id: 2, text: "partial ans".into() },
        });
        assert_eq!(client.state().active_operation, ActiveOperation::Streaming);

        let t0 = Instant::now();
        assert!(!client.on_escape(t0));
        assert!(client.on_escape(t0 + Duration::from_millis(300)));

        // The stream is closed, the cancel endpoint was hit, the operation
        // is idle again, and partial messages survive.
        assert!(client.transport.stream_closed[0].load(Ordering::SeqCst));
        assert!(matches!(
            client.transport.requests.last(),
            Some(Effect::CancelCall { .. })
        ));
        assert_eq!(client.state().active_operation, ActiveOperation::None);
        assert_eq!(client.state().messages.len(), 2);
        assert_eq!(client.state().messages[1].id, MessageId::Real(2));
        assert_eq!(client.state().messages[1].text, "partial ans");
        assert_eq!(client.state().phase(), SessionPhase::SessionReady);
    }

    #[test]
    fn single_escape_does_not_cancel() {
        let mut client = SessionClient::new(RecordingTransport::default());
        client.dispatch(Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        client.dispatch(initial("AbCdEfGh", vec![], true));

        assert!(!client.on_escape(Instant::now()));
        assert!(client.has_active_stream());
        assert!(client
            .transport
            .requests
            .iter()
            .all(|e| !matches!(e, Effect::CancelCall { .. })));
    }

    #[test]
    fn pagination_round_trip_through_the_client() {
        let mut client = SessionClient::new(RecordingTransport::default());
        client.dispatch(Action::UrlChanged { session_id: Some("AbCdEfGh".into()) });
        let mut init = initial("AbCdEfGh", vec![message(10, "recent")], false);
        if let Action::ServerEvent { event: StreamEvent::Initial { state, .. } } = &mut init {
            state.has_more = true;
        }
        client.dispatch(init);

        client.dispatch(Action::LoadEarlier);
        assert_eq!(client.state().active_operation, ActiveOperation::Loading);
        assert!(matches!(
            client.transport.requests.last(),
            Some(Effect::LoadEarlier { before: 10, .. })
        ));

        client.dispatch(Action::EarlierMessagesLoaded {
            messages: vec![message(4, "older")],
            has_more: false,
        });
        assert_eq!(client.state().messages[0].id, MessageId::Real(4));
        assert_eq!(client.state().active_operation, ActiveOperation::None);
    }
}
