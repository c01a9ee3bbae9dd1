use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Liveness state of a registered agent.
///
/// `Busy` is advisory only (set by callers that want to reflect active
/// dispatch in listings); the registry itself only ever writes `Online` and
/// `Offline` (see `relay-core::registry`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn is_online(self) -> bool {
        matches!(self, AgentStatus::Online | AgentStatus::Busy)
    }
}

/// Rolling resource telemetry reported on `heartbeat`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub memory_percent: f32,
    #[serde(default)]
    pub disk_percent: f32,
    #[serde(default)]
    pub load: f32,
}

impl Telemetry {
    /// Largest absolute percentage-point delta across the comparable
    /// fields, used by the registry to decide whether a heartbeat is
    /// "meaningful" enough to broadcast (spec: `>= 5%`).
    pub fn max_delta(&self, other: &Telemetry) -> f32 {
        let deltas = [
            (self.cpu_percent - other.cpu_percent).abs(),
            (self.memory_percent - other.memory_percent).abs(),
            (self.disk_percent - other.disk_percent).abs(),
        ];
        deltas.into_iter().fold(0.0_f32, f32::max)
    }
}

/// Authoritative, process-owned record of a connected agent.
///
/// Agents are created on first `agent_hello` and never destroyed except by
/// explicit admin removal (see spec.md §3 Lifecycle); reconnection only
/// flips `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: HashMap<String, Value>,
    pub status: AgentStatus,
    /// Epoch millis of the last accepted heartbeat or hello.
    pub last_heartbeat_ms: u64,
    #[serde(default)]
    pub telemetry: Telemetry,
    /// Number of tasks currently dispatched to this agent and not yet
    /// terminal; used by the scheduler's lowest-load tiebreak.
    #[serde(default)]
    pub active_task_count: u32,
}

impl Agent {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn capability_bool(&self, name: &str) -> bool {
        matches!(self.capabilities.get(name), Some(Value::Bool(true)))
    }

    pub fn allows_concurrent_dispatch(&self) -> bool {
        self.capability_bool("concurrent")
    }
}

/// Payload an agent sends on first connect (`agent_hello`, spec.md §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHello {
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_delta_is_largest_absolute_change() {
        let a = Telemetry {
            cpu_percent: 10.0,
            memory_percent: 50.0,
            disk_percent: 20.0,
            load: 1.0,
        };
        let b = Telemetry {
            cpu_percent: 12.0,
            memory_percent: 40.0,
            disk_percent: 20.0,
            load: 1.0,
        };
        assert_eq!(a.max_delta(&b), 10.0);
    }

    #[test]
    fn role_and_tag_matching_is_case_insensitive() {
        let agent = Agent {
            id: "a1".into(),
            hostname: "h1".into(),
            display_name: None,
            roles: vec!["Worker".into()],
            tags: vec!["GPU".into()],
            capabilities: HashMap::new(),
            status: AgentStatus::Online,
            last_heartbeat_ms: 0,
            telemetry: Telemetry::default(),
            active_task_count: 0,
        };
        assert!(agent.has_role("worker"));
        assert!(agent.has_tag("gpu"));
        assert!(!agent.has_role("build"));
    }
}
