pub mod agent;
pub mod command;
pub mod event;
pub mod plan;
pub mod task;

pub use agent::{Agent, AgentHello, AgentStatus, Telemetry};
pub use command::{
    Command, CommandResult, CommandValidationError, DEFAULT_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS,
    MIN_TIMEOUT_SECONDS,
};
pub use event::{ControllerEvent, OutputStream};
pub use plan::{Plan, RiskLevel, WorkspaceType};
pub use task::{ApprovalRecord, Task, TaskStatus};

/// Current epoch-millis wall clock, used throughout the domain layer in
/// place of `chrono::Utc::now()` so ordering comparisons stay cheap
/// integer compares.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
