use serde::{Deserialize, Serialize};

use crate::command::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceType {
    Bare,
    Docker,
    Venv,
}

/// A structured execution plan produced by a planner and gated by the
/// safety validator before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Renamed on the wire to `target_agent` to match the schema a
    /// planner is prompted with (spec.md §6.4); the richer `_id` suffix is
    /// kept on the Rust side since the REST/internal representation of a
    /// `Plan` is always embedded inside a `Task`, where `_id` fields are
    /// the convention.
    #[serde(default, rename = "target_agent")]
    pub target_agent_id: Option<String>,
    #[serde(default)]
    pub target_role: Option<String>,
    pub workspace: String,
    pub workspace_type: WorkspaceType,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub requires_approval: bool,
    pub commands: Vec<Command>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
