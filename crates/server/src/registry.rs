// crates/server/src/registry.rs
//! The active-call registry: at most one in-flight model call per main
//! session, with a broadcast channel so late-joining SSE streams replay into
//! the same call. Owned by `AppState` and shut down at teardown; all access
//! goes through it rather than through globals.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use angel_types::StreamEvent;

/// One in-flight model call.
pub struct ActiveCall {
    pub session_id: String,
    pub branch_id: i64,
    pub started_at: Instant,
    events: broadcast::Sender<StreamEvent>,
    pub cancel: CancellationToken,
}

impl ActiveCall {
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Broadcast an event to every connected stream. Lagging or absent
    /// receivers are not an error.
    pub fn send(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

#[derive(Default)]
pub struct StreamRegistry {
    calls: Mutex<HashMap<String, std::sync::Arc<ActiveCall>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call for a session, cancelling any previous one.
    pub fn begin(&self, session_id: &str, branch_id: i64) -> std::sync::Arc<ActiveCall> {
        let call = std::sync::Arc::new(ActiveCall {
            session_id: session_id.to_string(),
            branch_id,
            started_at: Instant::now(),
            events: broadcast::channel(256).0,
            cancel: CancellationToken::new(),
        });
        let previous = self
            .lock()
            .insert(session_id.to_string(), call.clone());
        if let Some(previous) = previous {
            debug!(session_id, "superseding previous call");
            previous.cancel.cancel();
        }
        call
    }

    pub fn get(&self, session_id: &str) -> Option<std::sync::Arc<ActiveCall>> {
        self.lock().get(session_id).cloned()
    }

    /// Remove the call if it is still the registered one for its session.
    pub fn finish(&self, call: &std::sync::Arc<ActiveCall>) {
        let mut calls = self.lock();
        if let Some(current) = calls.get(&call.session_id) {
            if std::sync::Arc::ptr_eq(current, call) {
                calls.remove(&call.session_id);
            }
        }
    }

    /// Cancel a session's in-flight call. Returns whether one existed.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.lock().remove(session_id) {
            Some(call) => {
                call.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything; used at server teardown.
    pub fn shutdown(&self) {
        for (_, call) in self.lock().drain() {
            call.cancel.cancel();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, std::sync::Arc<ActiveCall>>> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner())
    }
}
