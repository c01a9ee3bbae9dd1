use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::command::CommandResult;
use crate::task::Task;

/// Which of a command's two output streams a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Broadcast on the Event Bus and fanned out to every `/ws/client`
/// subscriber (spec.md §4.6). Tagged so UI observers can dispatch on
/// `type` without a separate envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    /// Sent once, synchronously, to a newly-subscribed client before any
    /// other event — a full snapshot so the client never has to diff
    /// against a partial view.
    InitialState {
        agents: Vec<Agent>,
        tasks: Vec<Task>,
    },
    AgentConnected {
        agent: Agent,
    },
    AgentDisconnected {
        agent_id: String,
    },
    /// Emitted on heartbeats that cross the telemetry-delta threshold, and
    /// on any role/tag/capability change.
    AgentUpdated {
        agent: Agent,
    },
    /// Emitted whenever a task's `version` increases.
    TaskUpdated {
        task: Task,
    },
    /// Incremental output for one command, coalesced by the Event Bus per
    /// the 50ms same-(task_id, stream) batching rule before being flushed.
    TaskOutput {
        task_id: String,
        command_index: usize,
        stream: OutputStream,
        content: String,
    },
    /// Emitted in place of further `task_output` events once a task's
    /// buffered output has hit the retention cap (spec.md §4.6); the
    /// client should stop expecting `task_output` for this task.
    TaskOutputTruncated {
        task_id: String,
    },
    CommandResult {
        task_id: String,
        result: CommandResult,
    },
}

impl ControllerEvent {
    /// `true` for events whose payload is already a full snapshot, used by
    /// the per-subscriber coalescing layer to know it's safe to drop
    /// everything queued before this event rather than coalesce it away.
    pub fn is_snapshot(&self) -> bool {
        matches!(self, ControllerEvent::InitialState { .. })
    }
}
