use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_observability::{record_audit_event, AuditEvent};
use relay_orchestrator::TaskEvent;
use relay_types::{now_ms, Command, CommandResult, ControllerEvent, OutputStream};
use relay_wire::{AgentMessage, ControllerToAgentMessage};

use crate::event_bus::EventBus;
use crate::registry::{AgentRegistry, DispatchSelectionError};
use crate::task_store::{TaskStore, TaskStoreError};

#[derive(Debug, thiserror::Error)]
pub enum AgentLinkError {
    #[error("agent link is closed")]
    Closed,
}

/// Outbound half of one agent's connection. The transport itself (the actual
/// WebSocket) lives in `relay-server`; the dispatcher only needs to push a
/// message and find out, via an `Err`, that the link is gone.
#[async_trait]
pub trait AgentLink: Send + Sync {
    async fn send(&self, message: ControllerToAgentMessage) -> Result<(), AgentLinkError>;
}

enum Inbound {
    Output { command_index: usize, stream: OutputStream, content: String },
    Result(CommandResult),
}

enum StepOutcome {
    Result(CommandResult),
    TimedOut,
    Disconnected,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Selection(#[from] DispatchSelectionError),
    #[error(transparent)]
    Store(#[from] TaskStoreError),
}

/// Selects an agent, sends a task's commands in order, and reconciles the
/// agent's streamed replies back into the Task Store (spec.md §4.5). One
/// `Dispatcher` is shared for the whole process; `run` is spawned per task.
#[derive(Clone)]
pub struct Dispatcher {
    registry: AgentRegistry,
    tasks: TaskStore,
    event_bus: EventBus,
    links: Arc<AsyncMutex<HashMap<String, Arc<dyn AgentLink>>>>,
    agent_locks: Arc<AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    inflight: Arc<AsyncMutex<HashMap<String, mpsc::UnboundedSender<Inbound>>>>,
    cancel_tokens: Arc<AsyncMutex<HashMap<String, CancellationToken>>>,
    network_slack_seconds: u64,
    cancel_grace_seconds: u64,
}

impl Dispatcher {
    pub fn new(registry: AgentRegistry, tasks: TaskStore, event_bus: EventBus) -> Self {
        Self {
            registry,
            tasks,
            event_bus,
            links: Arc::new(AsyncMutex::new(HashMap::new())),
            agent_locks: Arc::new(AsyncMutex::new(HashMap::new())),
            inflight: Arc::new(AsyncMutex::new(HashMap::new())),
            cancel_tokens: Arc::new(AsyncMutex::new(HashMap::new())),
            network_slack_seconds: 10,
            cancel_grace_seconds: 5,
        }
    }

    pub fn with_timing(mut self, network_slack_seconds: u64, cancel_grace_seconds: u64) -> Self {
        self.network_slack_seconds = network_slack_seconds;
        self.cancel_grace_seconds = cancel_grace_seconds;
        self
    }

    pub async fn register_link(&self, agent_id: impl Into<String>, link: Arc<dyn AgentLink>) {
        self.links.lock().await.insert(agent_id.into(), link);
    }

    pub async fn remove_link(&self, agent_id: &str) {
        self.links.lock().await.remove(agent_id);
        if let Some(tx) = self.inflight.lock().await.remove(agent_id) {
            drop(tx);
        }
    }

    /// Routes a message received on an agent's link to whichever task
    /// dispatch loop is waiting on it. Unmatched messages (no in-flight
    /// waiter, e.g. a stale chunk after a timeout) are dropped.
    pub async fn on_agent_message(&self, message: AgentMessage) {
        match message {
            AgentMessage::TaskOutput { task_id, command_index, stream, content } => {
                if let Some(tx) = self.inflight.lock().await.get(&task_id) {
                    let _ = tx.send(Inbound::Output { command_index, stream, content });
                }
            }
            AgentMessage::CommandResult { task_id, command_index, exit_code, stderr, duration_ms } => {
                if let Some(tx) = self.inflight.lock().await.get(&task_id) {
                    let _ = tx.send(Inbound::Result(CommandResult {
                        command_index,
                        exit_code,
                        stdout: String::new(),
                        stderr: stderr.unwrap_or_default(),
                        duration_ms,
                        completed_at_ms: now_ms(),
                    }));
                }
            }
            AgentMessage::AgentHello { .. } | AgentMessage::Heartbeat { .. } | AgentMessage::Ack { .. } => {}
        }
    }

    /// Signals cooperative cancellation of a task's in-flight command, if
    /// any. The task's status transition itself is the caller's
    /// responsibility (`TaskStore::cancel`); this only interrupts the loop.
    pub async fn request_cancel(&self, task_id: &str) {
        if let Some(token) = self.cancel_tokens.lock().await.get(task_id) {
            token.cancel();
        }
    }

    async fn agent_lock(&self, agent_id: &str) -> Arc<AsyncMutex<()>> {
        self.agent_locks
            .lock()
            .await
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn link_for(&self, agent_id: &str) -> Option<Arc<dyn AgentLink>> {
        self.links.lock().await.get(agent_id).cloned()
    }

    async fn publish_output(&self, task_id: &str, command_index: usize, stream: OutputStream, content: String) {
        let _ = self
            .tasks
            .mutate(task_id, now_ms(), |t| t.append_framed_output(command_index, &content))
            .await;
        self.event_bus.publish(ControllerEvent::TaskOutput {
            task_id: task_id.to_string(),
            command_index,
            stream,
            content,
        });
    }

    async fn record_result(&self, task_id: &str, result: CommandResult) {
        let outcome = result.clone();
        let _ = self
            .tasks
            .mutate(task_id, now_ms(), |t| t.results.push(result.clone()))
            .await;
        record_audit_event(
            tracing::Level::INFO,
            AuditEvent {
                event: "command_result",
                task_id: Some(task_id),
                agent_id: None,
                command_index: Some(outcome.command_index),
                status: Some(if outcome.exit_code == 0 { "ok" } else { "error" }),
                detail: None,
            },
        );
        self.event_bus.publish(ControllerEvent::CommandResult {
            task_id: task_id.to_string(),
            result: outcome,
        });
    }

    /// Spawns the dispatch loop for a task already in `ready`. No-op if the
    /// task's plan has no commands: per spec.md §8 an empty plan completes
    /// immediately.
    pub fn spawn(&self, task_id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.run(&task_id).await {
                warn!(task_id, error = %err, "task dispatch failed before it could reach a terminal state");
            }
        });
    }

    async fn run(&self, task_id: &str) -> Result<(), DispatchError> {
        let task = self.tasks.get(task_id).await?;
        let plan = match task.plan {
            Some(plan) => plan,
            None => return Ok(()),
        };

        let agent = match self
            .registry
            .select_for_dispatch(plan.target_agent_id.as_deref(), plan.target_role.as_deref())
            .await
        {
            Ok(agent) => agent,
            Err(err) => {
                self.tasks
                    .transition(task_id, TaskEvent::Fail, now_ms(), |t| {
                        t.error = Some(format!("AgentUnavailable: {err}"));
                    })
                    .await?;
                return Ok(());
            }
        };

        let lock = self.agent_lock(&agent.id).await;
        let _permit = if agent.allows_concurrent_dispatch() {
            None
        } else {
            Some(lock.lock().await)
        };

        self.registry.increment_active_tasks(&agent.id).await;
        let result = self.run_with_agent(task_id, &agent.id, &plan.commands).await;
        self.registry.decrement_active_tasks(&agent.id).await;
        self.cancel_tokens.lock().await.remove(task_id);
        self.inflight.lock().await.remove(task_id);
        result
    }

    async fn run_with_agent(
        &self,
        task_id: &str,
        agent_id: &str,
        commands: &[Command],
    ) -> Result<(), DispatchError> {
        let now = now_ms();
        if commands.is_empty() {
            self.tasks
                .transition(task_id, TaskEvent::Dispatch, now, |t| {
                    t.assigned_agent_id = Some(agent_id.to_string());
                })
                .await?;
            self.tasks.transition(task_id, TaskEvent::Complete, now_ms(), |_| {}).await?;
            return Ok(());
        }

        self.tasks
            .transition(task_id, TaskEvent::Dispatch, now, |t| {
                t.assigned_agent_id = Some(agent_id.to_string());
            })
            .await?;

        let cancel_token = CancellationToken::new();
        self.cancel_tokens.lock().await.insert(task_id.to_string(), cancel_token.clone());

        for (index, command) in commands.iter().enumerate() {
            let Some(link) = self.link_for(agent_id).await else {
                self.fail_disconnected(task_id, agent_id, index).await?;
                return Ok(());
            };

            let (tx, mut rx) = mpsc::unbounded_channel();
            self.inflight.lock().await.insert(task_id.to_string(), tx);

            if link
                .send(ControllerToAgentMessage::CommandExecute {
                    task_id: task_id.to_string(),
                    command_index: index,
                    dir: command.dir.clone(),
                    run: command.run.clone(),
                    timeout_seconds: command.timeout_seconds,
                    env: command.env.clone(),
                })
                .await
                .is_err()
            {
                self.fail_disconnected(task_id, agent_id, index).await?;
                return Ok(());
            }

            let outcome = self
                .await_step(task_id, index, &mut rx, &cancel_token, command.timeout_seconds)
                .await;

            match outcome {
                StepOutcome::Result(result) => {
                    let exit_code = result.exit_code;
                    self.record_result(task_id, result).await;
                    if exit_code != 0 && !command.continue_on_error {
                        self.tasks
                            .transition(task_id, TaskEvent::Fail, now_ms(), |t| {
                                t.error = Some(format!(
                                    "command {index} ({}) exited with {exit_code}",
                                    command.run
                                ));
                            })
                            .await?;
                        return Ok(());
                    }
                }
                StepOutcome::TimedOut => {
                    if let Some(link) = self.link_for(agent_id).await {
                        let _ = link
                            .send(ControllerToAgentMessage::CommandCancel {
                                task_id: task_id.to_string(),
                                command_index: index,
                            })
                            .await;
                    }
                    let synthetic = CommandResult {
                        command_index: index,
                        exit_code: -2,
                        stdout: String::new(),
                        stderr: String::new(),
                        duration_ms: (command.timeout_seconds as u64 + self.network_slack_seconds) * 1000,
                        completed_at_ms: now_ms(),
                    };
                    self.record_result(task_id, synthetic).await;
                    self.tasks
                        .transition(task_id, TaskEvent::Fail, now_ms(), |t| {
                            t.error = Some(format!("command {index} timed out after {}s", command.timeout_seconds));
                        })
                        .await?;
                    return Ok(());
                }
                StepOutcome::Disconnected => {
                    self.fail_disconnected(task_id, agent_id, index).await?;
                    return Ok(());
                }
                StepOutcome::Cancelled => {
                    if let Some(link) = self.link_for(agent_id).await {
                        let _ = link
                            .send(ControllerToAgentMessage::CommandCancel {
                                task_id: task_id.to_string(),
                                command_index: index,
                            })
                            .await;
                    }
                    let grace = Duration::from_secs(self.cancel_grace_seconds);
                    let result = tokio::time::timeout(grace, self.await_cooperative_result(index, &mut rx))
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or(CommandResult {
                            command_index: index,
                            exit_code: -1,
                            stdout: String::new(),
                            stderr: String::new(),
                            duration_ms: 0,
                            completed_at_ms: now_ms(),
                        });
                    self.record_result(task_id, result).await;
                    // The caller already drove the task to `cancelled`; just stop.
                    return Ok(());
                }
            }
        }

        self.tasks.transition(task_id, TaskEvent::Complete, now_ms(), |_| {}).await?;
        info!(task_id, agent_id, "task completed");
        Ok(())
    }

    async fn await_cooperative_result(
        &self,
        expected_index: usize,
        rx: &mut mpsc::UnboundedReceiver<Inbound>,
    ) -> Option<CommandResult> {
        loop {
            match rx.recv().await? {
                Inbound::Output { .. } => continue,
                Inbound::Result(result) if result.command_index == expected_index => return Some(result),
                Inbound::Result(_) => continue,
            }
        }
    }

    async fn await_step(
        &self,
        task_id: &str,
        expected_index: usize,
        rx: &mut mpsc::UnboundedReceiver<Inbound>,
        cancel_token: &CancellationToken,
        timeout_seconds: u32,
    ) -> StepOutcome {
        let mut deadline =
            tokio::time::Instant::now() + Duration::from_secs(timeout_seconds as u64 + self.network_slack_seconds);
        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return StepOutcome::Cancelled,
                inbound = rx.recv() => match inbound {
                    Some(Inbound::Output { command_index, stream, content }) => {
                        if command_index == expected_index {
                            self.publish_output(task_id, command_index, stream, content).await;
                            deadline = tokio::time::Instant::now()
                                + Duration::from_secs(timeout_seconds as u64 + self.network_slack_seconds);
                        }
                    }
                    Some(Inbound::Result(result)) if result.command_index == expected_index => {
                        return StepOutcome::Result(result);
                    }
                    Some(Inbound::Result(_)) => continue,
                    None => return StepOutcome::Disconnected,
                },
                _ = tokio::time::sleep_until(deadline) => return StepOutcome::TimedOut,
            }
        }
    }

    async fn fail_disconnected(&self, task_id: &str, agent_id: &str, command_index: usize) -> Result<(), DispatchError> {
        let synthetic = CommandResult {
            command_index,
            exit_code: -3,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            completed_at_ms: now_ms(),
        };
        self.record_result(task_id, synthetic).await;
        // The link is gone; reflect that in the registry too, rather than
        // leaving the agent `online` until the next heartbeat reap.
        let _ = self.registry.disconnect(agent_id).await;
        self.tasks
            .transition(task_id, TaskEvent::Fail, now_ms(), |t| {
                t.error = Some(format!("AgentDisconnected: agent disconnected during command {command_index}"));
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use relay_types::{AgentHello, Plan, RiskLevel, TaskStatus, WorkspaceType};

    struct RecordingLink {
        sent: StdMutex<Vec<ControllerToAgentMessage>>,
    }

    impl RecordingLink {
        fn new() -> Self {
            Self { sent: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl AgentLink for RecordingLink {
        async fn send(&self, message: ControllerToAgentMessage) -> Result<(), AgentLinkError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn plan_with(commands: Vec<Command>) -> Plan {
        Plan {
            target_agent_id: Some("a1".to_string()),
            target_role: None,
            workspace: "default".to_string(),
            workspace_type: WorkspaceType::Bare,
            steps: vec![],
            reasoning: String::new(),
            risk_level: RiskLevel::Low,
            requires_approval: false,
            commands,
        }
    }

    async fn online_agent(registry: &AgentRegistry, id: &str) {
        registry
            .register(
                AgentHello {
                    id: id.to_string(),
                    hostname: format!("{id}.local"),
                    display_name: None,
                    roles: vec![],
                    tags: vec![],
                    capabilities: Default::default(),
                },
                0,
            )
            .await;
    }

    #[tokio::test]
    async fn empty_plan_completes_immediately() {
        let event_bus = EventBus::new();
        let registry = AgentRegistry::new(event_bus.clone(), 60_000);
        let tasks = TaskStore::new(event_bus.clone());
        online_agent(&registry, "a1").await;

        let task = tasks.create("noop".to_string(), 0).await;
        tasks.transition(&task.id, TaskEvent::StartPlanning, 0, |_| {}).await.unwrap();
        tasks
            .transition(&task.id, TaskEvent::PlanReady { requires_approval: false }, 0, |t| {
                t.plan = Some(plan_with(vec![]));
            })
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(registry, tasks.clone(), event_bus);
        dispatcher.run(&task.id).await.unwrap();

        let finished = tasks.get(&task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn missing_link_fails_task_as_disconnected() {
        let event_bus = EventBus::new();
        let registry = AgentRegistry::new(event_bus.clone(), 60_000);
        let tasks = TaskStore::new(event_bus.clone());
        online_agent(&registry, "a1").await;

        let task = tasks.create("run it".to_string(), 0).await;
        tasks.transition(&task.id, TaskEvent::StartPlanning, 0, |_| {}).await.unwrap();
        tasks
            .transition(&task.id, TaskEvent::PlanReady { requires_approval: false }, 0, |t| {
                t.plan = Some(plan_with(vec![Command::new(".", "uptime")]));
            })
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(registry, tasks.clone(), event_bus);
        dispatcher.run(&task.id).await.unwrap();

        let finished = tasks.get(&task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        assert!(finished.error.unwrap().contains("disconnected"));
    }

    #[tokio::test]
    async fn successful_single_command_completes_task() {
        let event_bus = EventBus::new();
        let registry = AgentRegistry::new(event_bus.clone(), 60_000);
        let tasks = TaskStore::new(event_bus.clone());
        online_agent(&registry, "a1").await;

        let task = tasks.create("run it".to_string(), 0).await;
        tasks.transition(&task.id, TaskEvent::StartPlanning, 0, |_| {}).await.unwrap();
        tasks
            .transition(&task.id, TaskEvent::PlanReady { requires_approval: false }, 0, |t| {
                t.plan = Some(plan_with(vec![Command::new(".", "uptime")]));
            })
            .await
            .unwrap();

        let link: Arc<dyn AgentLink> = Arc::new(RecordingLink::new());
        let dispatcher = Dispatcher::new(registry, tasks.clone(), event_bus);
        dispatcher.register_link("a1", link).await;

        let task_id = task.id.clone();
        let dispatcher_clone = dispatcher.clone();
        let run_handle = tokio::spawn(async move { dispatcher_clone.run(&task_id).await });

        // Give the dispatch loop a chance to register its inflight channel.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher
            .on_agent_message(AgentMessage::CommandResult {
                task_id: task.id.clone(),
                command_index: 0,
                exit_code: 0,
                stderr: None,
                duration_ms: 5,
            })
            .await;

        run_handle.await.unwrap().unwrap();
        let finished = tasks.get(&task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        assert_eq!(finished.results.len(), 1);
    }
}
