use serde::{Deserialize, Serialize};

use crate::command::CommandResult;
use crate::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    AwaitingApproval,
    Ready,
    Running,
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Rejected | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
    /// Opaque actor identifier (e.g. a user id); the core places no
    /// constraints on its shape.
    #[serde(default)]
    pub actor: Option<String>,
    pub decided_at_ms: u64,
}

/// A tracked unit of work, from submission through a terminal outcome.
///
/// See spec.md §3 for the field-level invariants; `version` strictly
/// increases on every mutation and is what the Event Bus uses to coalesce
/// duplicate `task_updated` broadcasts (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub request: String,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub status: TaskStatus,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub assigned_agent_id: Option<String>,
    #[serde(default)]
    pub results: Vec<CommandResult>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub approval: Option<ApprovalRecord>,
    pub version: u64,
    /// Index of the command whose framing prefix was emitted most
    /// recently; tracked so `append_framed_output` only emits `"[cmd N] "`
    /// once per command rather than once per chunk. Not part of the wire
    /// contract.
    #[serde(skip, default)]
    last_framed_command: Option<usize>,
}

impl Task {
    pub fn new(id: impl Into<String>, request: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            request: request.into(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            status: TaskStatus::Pending,
            plan: None,
            assigned_agent_id: None,
            results: Vec::new(),
            output: String::new(),
            error: None,
            approval: None,
            version: 1,
            last_framed_command: None,
        }
    }

    /// Append a command's framed output, matching the deterministic
    /// framing rule of spec.md §3: `"[cmd N] "` before each command's
    /// first emitted chunk, and nothing but the raw chunk for subsequent
    /// chunks belonging to the same command.
    pub fn append_framed_output(&mut self, command_index: usize, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        if self.last_framed_command != Some(command_index) {
            self.output.push_str(&format!("[cmd {command_index}] "));
            self.last_framed_command = Some(command_index);
        }
        self.output.push_str(chunk);
    }
}
