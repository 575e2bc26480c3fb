// crates/types/src/lib.rs
//! Shared domain and wire types for the Angel session core.

pub mod event;
pub mod message;
pub mod session;

pub use event::{split_once_newline, EventParseError, InitialState, StreamEvent};
pub use message::{
    Attachment, BranchChoice, HistoryMessage, Message, MessageType, SendMessageRequest,
};
pub use session::{
    SessionEnv, SessionMeta, ShellCommand, ShellCommandStatus, Workspace,
};
