// crates/session/src/lib.rs
//! Client-side session state machine.
//!
//! A pure reducer ([`fsm`]) models the active session, its message list, and
//! the optimistic-update lifecycle; the [`ops::OperationManager`] owns the
//! at-most-one live stream and the cancellation chord. All I/O is behind
//! traits so the whole crate tests without a server.

pub mod client;
pub mod fsm;
pub mod ops;

pub use client::{SessionClient, Transport};
pub use fsm::{
    reduce, Action, ActiveOperation, ChatMessage, Effect, MessageId, SessionPhase, SessionState,
};
pub use ops::{OperationManager, StreamHandle, ESCAPE_CHORD_WINDOW};
