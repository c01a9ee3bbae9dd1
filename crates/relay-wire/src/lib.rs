pub mod agent;
pub mod client;
pub mod rest;

pub use agent::{AgentMessage, ControllerToAgentMessage};
pub use client::{ClientToServerMessage, ServerControlMessage};
pub use rest::{AgentCounts, ApproveTaskRequest, CreateTaskRequest, ErrorBody, HealthResponse, ListTasksQuery};

/// The `Plan` JSON schema a live planner is told to produce, rendered as a
/// string for inclusion in an LLM system prompt.
pub const PLAN_JSON_SCHEMA: &str = r#"{
  "target_agent": "string (optional)",
  "target_role": "string (optional)",
  "workspace": "string",
  "workspace_type": "bare | docker | venv",
  "steps": ["string"],
  "reasoning": "string",
  "risk_level": "low | medium | high",
  "requires_approval": "bool",
  "commands": [
    {
      "dir": "string",
      "run": "string",
      "timeout_seconds": "int (optional)",
      "continue_on_error": "bool (optional)",
      "env": { "string": "string" }
    }
  ]
}"#;
