use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use relay_types::{Agent, AgentHello, AgentStatus, ControllerEvent, Telemetry};

use crate::event_bus::EventBus;

/// Minimum telemetry change, in percentage points on any tracked metric,
/// that justifies an `agent_updated` broadcast on heartbeat.
const TELEMETRY_DELTA_THRESHOLD: f32 = 5.0;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("no agent registered with id `{0}`")]
pub struct AgentNotFound(pub String);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DispatchSelectionError {
    #[error("target agent `{0}` is not online")]
    TargetAgentUnavailable(String),
    #[error("no online agent matches role `{0}`")]
    NoAgentForRole(String),
    #[error("no online agent is available")]
    NoAgentAvailable,
}

/// Inventory of connected agents: identity, capabilities, liveness.
/// Guarded by a single read-write lock (spec.md §5): many concurrent
/// readers for dashboards and selection snapshots, exclusive writers on
/// register/heartbeat/disconnect.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Agent>>>,
    event_bus: EventBus,
    heartbeat_timeout_ms: u64,
}

impl AgentRegistry {
    pub fn new(event_bus: EventBus, heartbeat_timeout_ms: u64) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
            heartbeat_timeout_ms,
        }
    }

    /// Idempotent: creates on first hello, updates identity fields on
    /// reconnect. Always transitions to `online` and broadcasts
    /// `agent_connected`.
    pub async fn register(&self, hello: AgentHello, now_ms: u64) -> Agent {
        let mut agents = self.agents.write().await;
        let agent = agents
            .entry(hello.id.clone())
            .and_modify(|existing| {
                existing.hostname = hello.hostname.clone();
                existing.display_name = hello.display_name.clone();
                existing.roles = hello.roles.clone();
                existing.tags = hello.tags.clone();
                existing.capabilities = hello.capabilities.clone();
                existing.status = AgentStatus::Online;
                existing.last_heartbeat_ms = now_ms;
            })
            .or_insert_with(|| Agent {
                id: hello.id.clone(),
                hostname: hello.hostname.clone(),
                display_name: hello.display_name.clone(),
                roles: hello.roles.clone(),
                tags: hello.tags.clone(),
                capabilities: hello.capabilities.clone(),
                status: AgentStatus::Online,
                last_heartbeat_ms: now_ms,
                telemetry: Telemetry::default(),
                active_task_count: 0,
            })
            .clone();

        self.event_bus.publish(ControllerEvent::AgentConnected { agent: agent.clone() });
        agent
    }

    /// Refreshes the heartbeat deadline and telemetry. Flips `offline` →
    /// `online` if the agent had timed out but reconnected without a full
    /// `agent_hello` (e.g. a heartbeat racing a reap); never otherwise
    /// changes `status`. Broadcasts `agent_updated` only on a meaningful
    /// telemetry delta.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        telemetry: Telemetry,
        now_ms: u64,
    ) -> Result<(), AgentNotFound> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentNotFound(agent_id.to_string()))?;

        let delta = agent.telemetry.max_delta(&telemetry);
        let was_offline = agent.status == AgentStatus::Offline;

        agent.telemetry = telemetry;
        agent.last_heartbeat_ms = now_ms;
        if was_offline {
            agent.status = AgentStatus::Online;
        }

        if was_offline || delta >= TELEMETRY_DELTA_THRESHOLD {
            let snapshot = agent.clone();
            drop(agents);
            self.event_bus.publish(ControllerEvent::AgentUpdated { agent: snapshot });
        }
        Ok(())
    }

    /// Sets status `offline` and broadcasts `agent_disconnected`. Any
    /// dispatch reservation (`active_task_count`) is left as-is; the
    /// scheduler is responsible for failing in-flight tasks on this agent.
    pub async fn disconnect(&self, agent_id: &str) -> Result<(), AgentNotFound> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentNotFound(agent_id.to_string()))?;
        agent.status = AgentStatus::Offline;
        drop(agents);
        self.event_bus.publish(ControllerEvent::AgentDisconnected {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub async fn online_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.status.is_online())
            .count()
    }

    pub async fn total_count(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn increment_active_tasks(&self, agent_id: &str) {
        if let Some(agent) = self.agents.write().await.get_mut(agent_id) {
            agent.active_task_count += 1;
        }
    }

    pub async fn decrement_active_tasks(&self, agent_id: &str) {
        if let Some(agent) = self.agents.write().await.get_mut(agent_id) {
            agent.active_task_count = agent.active_task_count.saturating_sub(1);
        }
    }

    /// Any agent still marked `online` whose last heartbeat is older than
    /// `heartbeat_timeout_ms` is disconnected. Returns the ids reaped.
    pub async fn reap(&self, now_ms: u64) -> Vec<String> {
        let stale: Vec<String> = {
            let agents = self.agents.read().await;
            agents
                .values()
                .filter(|a| {
                    a.status.is_online()
                        && now_ms.saturating_sub(a.last_heartbeat_ms) > self.heartbeat_timeout_ms
                })
                .map(|a| a.id.clone())
                .collect()
        };
        for id in &stale {
            let _ = self.disconnect(id).await;
        }
        stale
    }

    /// Dispatcher's agent-selection rule (spec.md §4.5), evaluated in
    /// order; first non-empty outcome wins.
    pub async fn select_for_dispatch(
        &self,
        target_agent_id: Option<&str>,
        target_role: Option<&str>,
    ) -> Result<Agent, DispatchSelectionError> {
        let agents = self.agents.read().await;

        if let Some(id) = target_agent_id {
            return agents
                .get(id)
                .filter(|a| a.status.is_online())
                .cloned()
                .ok_or_else(|| DispatchSelectionError::TargetAgentUnavailable(id.to_string()));
        }

        if let Some(role) = target_role {
            return agents
                .values()
                .filter(|a| a.status.is_online() && a.has_role(role))
                .min_by(tiebreak)
                .cloned()
                .ok_or_else(|| DispatchSelectionError::NoAgentForRole(role.to_string()));
        }

        agents
            .values()
            .filter(|a| a.status.is_online())
            .min_by(tiebreak)
            .cloned()
            .ok_or(DispatchSelectionError::NoAgentAvailable)
    }
}

fn tiebreak(a: &&Agent, b: &&Agent) -> std::cmp::Ordering {
    a.active_task_count
        .cmp(&b.active_task_count)
        .then_with(|| {
            a.telemetry
                .cpu_percent
                .partial_cmp(&b.telemetry.cpu_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .then_with(|| a.id.cmp(&b.id))
}
