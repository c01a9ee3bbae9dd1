pub mod routes;
pub mod ws_agent;
pub mod ws_client;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use relay_core::{AgentRegistry, Config, Dispatcher, EventBus, Orchestrator, TaskStore};

/// Everything a request handler needs, cloned per-request the way axum
/// `State` extractors expect (every field is internally `Arc`-backed).
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub heartbeat_timeout_ms: u64,
    /// Tracks the live `/ws/agent` connection per agent id so a
    /// reconnect can force the stale connection closed (spec.md §8:
    /// "an agent reconnecting with the same id ... must win"). The `u64`
    /// is a per-agent generation counter: a connection only clears its
    /// own slot on exit if no later connection has since claimed it.
    agent_connections: Arc<Mutex<HashMap<String, (u64, CancellationToken)>>>,
    /// Defaults to a no-op counter (reads as `0`) until `serve`'s caller
    /// wires in the real one returned by `init_process_logging`.
    pub audit_write_failures: relay_observability::AuditWriteFailures,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let event_bus = EventBus::new();
        let registry = AgentRegistry::new(event_bus.clone(), config.agent_heartbeat_timeout_seconds * 1000);
        let tasks = TaskStore::new(event_bus.clone());
        let dispatcher = Dispatcher::new(registry.clone(), tasks.clone(), event_bus.clone());
        let planner = relay_planner::client_from_env()
            .map(|client| std::sync::Arc::new(relay_planner::LivePlanner::new(client)) as std::sync::Arc<dyn relay_planner::Planner>)
            .unwrap_or_else(|| std::sync::Arc::new(relay_planner::StubPlanner));
        let validator = std::sync::Arc::new(relay_safety::Validator::new());
        let orchestrator = Orchestrator::new(registry, tasks, event_bus, dispatcher, planner, validator);
        Self {
            orchestrator,
            heartbeat_timeout_ms: config.agent_heartbeat_timeout_seconds * 1000,
            agent_connections: Arc::new(Mutex::new(HashMap::new())),
            audit_write_failures: relay_observability::AuditWriteFailures::default(),
        }
    }

    /// Wires in the audit-failure counter produced by `init_process_logging`.
    pub fn with_audit_write_failures(mut self, counter: relay_observability::AuditWriteFailures) -> Self {
        self.audit_write_failures = counter;
        self
    }

    /// Registers `token` as the live connection for `agent_id`, cancelling
    /// whatever connection previously held that slot. Returns the
    /// generation id assigned to this connection, to be passed back to
    /// `release_agent_connection` on cleanup.
    pub(crate) async fn supersede_agent_connection(&self, agent_id: &str, token: CancellationToken) -> u64 {
        let mut connections = self.agent_connections.lock().await;
        let generation = connections.get(agent_id).map_or(0, |(gen, _)| gen + 1);
        if let Some((_, previous)) = connections.insert(agent_id.to_string(), (generation, token)) {
            previous.cancel();
        }
        generation
    }

    /// Removes `agent_id`'s slot, but only if `generation` still matches
    /// the current occupant — prevents a superseded connection's cleanup
    /// from clobbering the connection that replaced it.
    pub(crate) async fn release_agent_connection(&self, agent_id: &str, generation: u64) {
        let mut connections = self.agent_connections.lock().await;
        if connections.get(agent_id).is_some_and(|(gen, _)| *gen == generation) {
            connections.remove(agent_id);
        }
    }
}

/// Binds the listener, spawns the background maintenance loops, and serves
/// until a ctrl-c or an unrecoverable accept error.
pub async fn serve(addr: SocketAddr, state: AppState, config: Config) -> anyhow::Result<()> {
    let heartbeat_registry = state.orchestrator.registry.clone();
    let retention_tasks = state.orchestrator.tasks.clone();
    let snapshot_tasks = state.orchestrator.tasks.clone();

    let heartbeat_reaper = tokio::spawn(relay_core::run_heartbeat_reaper(
        heartbeat_registry,
        Duration::from_secs(15),
    ));
    let retention_sweep = tokio::spawn(relay_core::run_retention_sweep(
        retention_tasks,
        config.task_retention_hours,
        Duration::from_secs(300),
    ));
    let snapshot_sweep = tokio::spawn(relay_core::run_snapshot_sweep(
        snapshot_tasks,
        config.state_dir.clone(),
        Duration::from_secs(30),
    ));

    let app = routes::router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "relay-server listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;

    heartbeat_reaper.abort();
    retention_sweep.abort();
    snapshot_sweep.abort();
    result?;
    Ok(())
}
