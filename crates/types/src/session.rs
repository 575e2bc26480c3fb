// crates/types/src/session.rs
//! Session, workspace, environment, and shell-command rows.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// A session row.
///
/// The catalog carries a denormalized copy for listing and search; the row
/// inside the session DB (local id `""` for the main session) is
/// authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    #[ts(type = "number")]
    pub created_at: i64,
    #[ts(type = "number")]
    pub last_updated_at: i64,
    pub system_prompt: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_branch_id: Option<i64>,
    /// Pointer to the virtual root message; `None` on legacy sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_first_id: Option<i64>,
}

/// A workspace groups sessions and supplies their default system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub default_system_prompt: String,
}

/// One generation of a session's exposed directory roots.
///
/// Generation 0 is the initial environment; each `roots` change appends a new
/// generation and emits an `env_changed` message into the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(rename_all = "camelCase")]
pub struct SessionEnv {
    pub session_id: String,
    pub generation: i64,
    pub roots: Vec<String>,
}

/// Lifecycle state of a sandboxed shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(rename_all = "snake_case")]
pub enum ShellCommandStatus {
    Running,
    Completed,
    Failed,
    /// The process never started (spawn error).
    FailedOnStartup,
}

impl ShellCommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShellCommandStatus::Running => "running",
            ShellCommandStatus::Completed => "completed",
            ShellCommandStatus::Failed => "failed",
            ShellCommandStatus::FailedOnStartup => "failed_on_startup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => ShellCommandStatus::Running,
            "completed" => ShellCommandStatus::Completed,
            "failed" => ShellCommandStatus::Failed,
            "failed_on_startup" => ShellCommandStatus::FailedOnStartup,
            _ => return None,
        })
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ShellCommandStatus::Running)
    }
}

/// A shell command run inside the per-session sandbox.
///
/// `stdout`/`stderr` grow while the command runs; clients poll incrementally
/// with byte offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../../frontend/src/types/generated/")]
#[serde(rename_all = "camelCase")]
pub struct ShellCommand {
    pub id: i64,
    pub branch_id: i64,
    pub command: String,
    pub status: ShellCommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[ts(type = "number")]
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub finished_at: Option<i64>,
}
