use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::Level;
use uuid::Uuid;

use relay_observability::{record_audit_event, AuditEvent};
use relay_orchestrator::{apply, InvalidTransition, TaskEvent};
use relay_types::{ApprovalRecord, ControllerEvent, Task, TaskStatus};

use crate::event_bus::EventBus;

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Planning => "planning",
        TaskStatus::AwaitingApproval => "awaiting_approval",
        TaskStatus::Ready => "ready",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Rejected => "rejected",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn audit_transition(task: &Task) {
    record_audit_event(
        Level::INFO,
        AuditEvent {
            event: "task_transition",
            task_id: Some(&task.id),
            agent_id: task.assigned_agent_id.as_deref(),
            command_index: None,
            status: Some(status_label(task.status)),
            detail: None,
        },
    );
}

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("no task with id `{0}`")]
    NotFound(String),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// Single source of truth for tasks. Per spec.md §5: a coarse index lock
/// guards the id → task map for listing and insertion, while every
/// individual task is additionally guarded by its own lock so that
/// concurrent mutations of distinct tasks never contend with each other.
#[derive(Clone)]
pub struct TaskStore {
    index: Arc<RwLock<HashMap<String, Arc<Mutex<Task>>>>>,
    event_bus: EventBus,
}

impl TaskStore {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            index: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
        }
    }

    pub async fn create(&self, request: String, now_ms: u64) -> Task {
        let task = Task::new(Uuid::new_v4().to_string(), request, now_ms);
        self.index
            .write()
            .await
            .insert(task.id.clone(), Arc::new(Mutex::new(task.clone())));
        task
    }

    async fn handle_of(&self, task_id: &str) -> Result<Arc<Mutex<Task>>, TaskStoreError> {
        self.index
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskStoreError::NotFound(task_id.to_string()))
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, TaskStoreError> {
        Ok(self.handle_of(task_id).await?.lock().await.clone())
    }

    pub async fn list(&self, status_filter: Option<TaskStatus>, limit: Option<usize>) -> Vec<Task> {
        let handles: Vec<Arc<Mutex<Task>>> = self.index.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            tasks.push(handle.lock().await.clone());
        }
        if let Some(status) = status_filter {
            tasks.retain(|t| t.status == status);
        }
        tasks.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        if let Some(limit) = limit {
            tasks.truncate(limit);
        }
        tasks
    }

    /// Apply a mutation without a state transition (e.g. appending
    /// streamed output); still bumps `version` and broadcasts
    /// `task_updated`, since the Event Bus coalesces on version alone.
    pub async fn mutate<F>(&self, task_id: &str, now_ms: u64, mutate: F) -> Result<Task, TaskStoreError>
    where
        F: FnOnce(&mut Task),
    {
        let handle = self.handle_of(task_id).await?;
        let mut task = handle.lock().await;
        mutate(&mut task);
        task.updated_at_ms = now_ms;
        task.version += 1;
        let snapshot = task.clone();
        drop(task);
        self.event_bus.publish(ControllerEvent::TaskUpdated { task: snapshot.clone() });
        Ok(snapshot)
    }

    /// Validate and apply a state transition, optionally mutating other
    /// fields atomically with it (e.g. attaching the produced `Plan`).
    pub async fn transition<F>(
        &self,
        task_id: &str,
        event: TaskEvent,
        now_ms: u64,
        mutate: F,
    ) -> Result<Task, TaskStoreError>
    where
        F: FnOnce(&mut Task),
    {
        let handle = self.handle_of(task_id).await?;
        let mut task = handle.lock().await;
        let next = apply(task.status, event)?;
        task.status = next;
        mutate(&mut task);
        task.updated_at_ms = now_ms;
        task.version += 1;
        let snapshot = task.clone();
        drop(task);
        audit_transition(&snapshot);
        self.event_bus.publish(ControllerEvent::TaskUpdated { task: snapshot.clone() });
        Ok(snapshot)
    }

    /// Only valid in `awaiting_approval`; idempotent if the task has
    /// already left `awaiting_approval` carrying the identical decision
    /// (same `approved`/`reason`).
    pub async fn approve(
        &self,
        task_id: &str,
        approved: bool,
        reason: Option<String>,
        actor: Option<String>,
        now_ms: u64,
    ) -> Result<Task, TaskStoreError> {
        let handle = self.handle_of(task_id).await?;
        let mut task = handle.lock().await;

        if task.status != TaskStatus::AwaitingApproval {
            if let Some(existing) = &task.approval {
                if existing.approved == approved && existing.reason == reason {
                    return Ok(task.clone());
                }
            }
            return Err(TaskStoreError::InvalidTransition(InvalidTransition {
                from: task.status,
                event: TaskEvent::Approve { approved },
            }));
        }

        let next = apply(task.status, TaskEvent::Approve { approved })?;
        task.status = next;
        task.approval = Some(ApprovalRecord {
            approved,
            reason,
            actor,
            decided_at_ms: now_ms,
        });
        task.updated_at_ms = now_ms;
        task.version += 1;
        let snapshot = task.clone();
        drop(task);
        audit_transition(&snapshot);
        self.event_bus.publish(ControllerEvent::TaskUpdated { task: snapshot.clone() });
        Ok(snapshot)
    }

    /// Cancel on a terminal task is a no-op returning the task unchanged
    /// (spec.md §6: cancelling something that already finished is not an
    /// error), rather than the `InvalidTransition` every other illegal
    /// event gets.
    pub async fn cancel(&self, task_id: &str, now_ms: u64) -> Result<Task, TaskStoreError> {
        let handle = self.handle_of(task_id).await?;
        if handle.lock().await.status.is_terminal() {
            return Ok(handle.lock().await.clone());
        }
        self.transition(task_id, TaskEvent::Cancel, now_ms, |_| {}).await
    }

    /// Retention sweep (spec.md §9): drops terminal tasks whose `updated_at_ms`
    /// is older than `max_age_ms`, in batches of at most `batch_limit` so a
    /// large backlog can't starve concurrent readers/writers of the index
    /// lock. Returns the number of tasks pruned.
    pub async fn prune_terminal_older_than(&self, now_ms: u64, max_age_ms: u64, batch_limit: usize) -> usize {
        let mut index = self.index.write().await;
        let stale: Vec<String> = {
            let mut candidates = Vec::new();
            for (id, handle) in index.iter() {
                let task = handle.lock().await;
                if task.status.is_terminal() && now_ms.saturating_sub(task.updated_at_ms) > max_age_ms {
                    candidates.push(id.clone());
                    if candidates.len() >= batch_limit {
                        break;
                    }
                }
            }
            candidates
        };
        for id in &stale {
            index.remove(id);
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let store = TaskStore::new(EventBus::new());
        let task = store.create("restart web1".to_string(), 100).await;
        let fetched = store.get(&task.id).await.unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn get_unknown_task_is_not_found() {
        let store = TaskStore::new(EventBus::new());
        assert!(matches!(store.get("missing").await, Err(TaskStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn transition_bumps_version_and_applies_mutation() {
        let store = TaskStore::new(EventBus::new());
        let task = store.create("x".to_string(), 0).await;
        let updated = store
            .transition(&task.id, TaskEvent::StartPlanning, 10, |t| {
                t.output.push_str("planning started\n");
            })
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Planning);
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_version_unchanged() {
        let store = TaskStore::new(EventBus::new());
        let task = store.create("x".to_string(), 0).await;
        let result = store.transition(&task.id, TaskEvent::Dispatch, 10, |_| {}).await;
        assert!(result.is_err());
        let unchanged = store.get(&task.id).await.unwrap();
        assert_eq!(unchanged.version, 1);
    }

    #[tokio::test]
    async fn approve_is_idempotent_with_same_decision() {
        let store = TaskStore::new(EventBus::new());
        let task = store.create("x".to_string(), 0).await;
        store
            .transition(&task.id, TaskEvent::StartPlanning, 0, |_| {})
            .await
            .unwrap();
        store
            .transition(&task.id, TaskEvent::PlanReady { requires_approval: true }, 0, |_| {})
            .await
            .unwrap();
        let first = store
            .approve(&task.id, true, Some("looks fine".to_string()), None, 1)
            .await
            .unwrap();
        assert_eq!(first.status, TaskStatus::Ready);
        let second = store
            .approve(&task.id, true, Some("looks fine".to_string()), None, 2)
            .await
            .unwrap();
        assert_eq!(second.version, first.version);
    }

    #[tokio::test]
    async fn approve_outside_awaiting_approval_with_different_decision_fails() {
        let store = TaskStore::new(EventBus::new());
        let task = store.create("x".to_string(), 0).await;
        let result = store.approve(&task.id, true, None, None, 0).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_orders_newest_first_and_respects_limit() {
        let store = TaskStore::new(EventBus::new());
        store.create("first".to_string(), 0).await;
        store.create("second".to_string(), 10).await;
        store.create("third".to_string(), 20).await;
        let tasks = store.list(None, Some(2)).await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].request, "third");
        assert_eq!(tasks[1].request, "second");
    }

    #[tokio::test]
    async fn cancel_is_legal_from_pending() {
        let store = TaskStore::new(EventBus::new());
        let task = store.create("x".to_string(), 0).await;
        let cancelled = store.cancel(&task.id, 5).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_on_terminal_task_is_noop() {
        let store = TaskStore::new(EventBus::new());
        let task = store.create("x".to_string(), 0).await;
        let cancelled = store.cancel(&task.id, 5).await.unwrap();
        assert_eq!(cancelled.version, 2);

        let unchanged = store.cancel(&task.id, 10).await.unwrap();
        assert_eq!(unchanged.status, TaskStatus::Cancelled);
        assert_eq!(unchanged.version, 2, "re-cancelling a terminal task must not bump version");
        assert_eq!(unchanged.updated_at_ms, 5, "re-cancelling a terminal task must not touch updated_at_ms");
    }

    #[tokio::test]
    async fn prune_only_removes_terminal_tasks_past_max_age() {
        let store = TaskStore::new(EventBus::new());
        let old = store.create("old".to_string(), 0).await;
        store.cancel(&old.id, 0).await.unwrap();
        let fresh = store.create("fresh".to_string(), 0).await;
        store.cancel(&fresh.id, 900_000).await.unwrap();
        let still_running = store.create("running".to_string(), 0).await;

        let pruned = store.prune_terminal_older_than(1_000_000, 500_000, 256).await;
        assert_eq!(pruned, 1);
        assert!(store.get(&old.id).await.is_err());
        assert!(store.get(&fresh.id).await.is_ok());
        assert!(store.get(&still_running.id).await.is_ok());
    }
}
