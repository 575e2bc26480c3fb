// crates/session/src/ops.rs
//! The operation manager: owns at most one live event stream and one abort
//! token for fetch-based operations. Opening a new stream closes the
//! previous one; navigating away does the same. Cancellation is cooperative:
//! Escape twice within a second aborts the active controller and closes the
//! stream, keeping whatever partial events already landed in the state.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Two Escape presses within this window cancel the active operation.
pub const ESCAPE_CHORD_WINDOW: Duration = Duration::from_secs(1);

/// A live event stream connection (an `EventSource` equivalent).
pub trait StreamHandle: Send {
    fn close(&self);
}

#[derive(Default)]
pub struct OperationManager {
    stream: Option<Box<dyn StreamHandle>>,
    abort: Option<CancellationToken>,
    last_escape: Option<Instant>,
}

impl OperationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new stream and abort token, closing any previous pair.
    pub fn open_stream(&mut self, stream: Box<dyn StreamHandle>, abort: CancellationToken) {
        self.close_stream();
        self.stream = Some(stream);
        self.abort = Some(abort);
    }

    /// Close the active stream and abort the in-flight fetch, if any.
    pub fn close_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        if let Some(abort) = self.abort.take() {
            abort.cancel();
        }
    }

    pub fn has_active_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Register an Escape press. Returns `true` when this press completes
    /// the chord and the active operation was cancelled.
    pub fn on_escape(&mut self, now: Instant) -> bool {
        match self.last_escape {
            Some(previous) if now.duration_since(previous) <= ESCAPE_CHORD_WINDOW => {
                self.last_escape = None;
                debug!("escape chord: cancelling active operation");
                self.close_stream();
                true
            }
            _ => {
                self.last_escape = Some(now);
                false
            }
        }
    }
}

impl Drop for OperationManager {
    fn drop(&mut self) {
        self.close_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct TestStream {
        closed: Arc<AtomicBool>,
    }

    impl StreamHandle for TestStream {
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn stream_pair() -> (Box<TestStream>, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (Box::new(TestStream { closed: closed.clone() }), closed)
    }

    #[test]
    fn opening_a_stream_closes_the_previous_one() {
        let mut ops = OperationManager::new();
        let (first, first_closed) = stream_pair();
        let first_abort = CancellationToken::new();
        ops.open_stream(first, first_abort.clone());

        let (second, second_closed) = stream_pair();
        ops.open_stream(second, CancellationToken::new());

        assert!(first_closed.load(Ordering::SeqCst));
        assert!(first_abort.is_cancelled());
        assert!(!second_closed.load(Ordering::SeqCst));
        assert!(ops.has_active_stream());
    }

    #[test]
    fn single_escape_does_nothing() {
        let mut ops = OperationManager::new();
        let (stream, closed) = stream_pair();
        ops.open_stream(stream, CancellationToken::new());

        assert!(!ops.on_escape(Instant::now()));
        assert!(!closed.load(Ordering::SeqCst));
        assert!(ops.has_active_stream());
    }

    #[test]
    fn escape_escape_within_window_cancels() {
        // Two presses 300 ms apart: the operation cancels, the stream
        // closes, and the abort token fires.
        let mut ops = OperationManager::new();
        let (stream, closed) = stream_pair();
        let abort = CancellationToken::new();
        ops.open_stream(stream, abort.clone());

        let t0 = Instant::now();
        assert!(!ops.on_escape(t0));
        assert!(ops.on_escape(t0 + Duration::from_millis(300)));

        assert!(closed.load(Ordering::SeqCst));
        assert!(abort.is_cancelled());
        assert!(!ops.has_active_stream());
    }

    #[test]
    fn slow_second_escape_restarts_the_chord() {
        let mut ops = OperationManager::new();
        let (stream, closed) = stream_pair();
        ops.open_stream(stream, CancellationToken::new());

        let t0 = Instant::now();
        assert!(!ops.on_escape(t0));
        // Too late: counts as a fresh first press.
        assert!(!ops.on_escape(t0 + Duration::from_millis(1500)));
        assert!(!closed.load(Ordering::SeqCst));
        // A quick third press completes the new chord.
        assert!(ops.on_escape(t0 + Duration::from_millis(1800)));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_closes_everything() {
        let (stream, closed) = stream_pair();
        let abort = CancellationToken::new();
        {
            let mut ops = OperationManager::new();
            ops.open_stream(stream, abort.clone());
        }
        assert!(closed.load(Ordering::SeqCst));
        assert!(abort.is_cancelled());
    }
}
