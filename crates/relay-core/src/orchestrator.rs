use std::sync::Arc;

use relay_observability::{record_audit_event, AuditEvent};
use relay_orchestrator::TaskEvent;
use relay_planner::{Planner, PlannerError};
use relay_safety::{Validator, Verdict};
use relay_types::{now_ms, RiskLevel, Task, TaskStatus};

use crate::dispatcher::Dispatcher;
use crate::event_bus::EventBus;
use crate::registry::AgentRegistry;
use crate::task_store::{TaskStore, TaskStoreError};

/// Binds Planner → Validator → Task Store → Dispatcher (spec.md §4.7). No
/// policy of its own beyond this wiring; `relay-server` calls through it
/// rather than touching the individual components directly.
#[derive(Clone)]
pub struct Orchestrator {
    pub registry: AgentRegistry,
    pub tasks: TaskStore,
    pub event_bus: EventBus,
    pub dispatcher: Dispatcher,
    planner: Arc<dyn Planner>,
    validator: Arc<Validator>,
}

impl Orchestrator {
    pub fn new(
        registry: AgentRegistry,
        tasks: TaskStore,
        event_bus: EventBus,
        dispatcher: Dispatcher,
        planner: Arc<dyn Planner>,
        validator: Arc<Validator>,
    ) -> Self {
        Self { registry, tasks, event_bus, dispatcher, planner, validator }
    }

    /// Creates the task and returns it immediately in `pending`; planning,
    /// validation, and (if clear) dispatch all happen on a spawned task so
    /// the REST handler never blocks on an LLM round trip.
    pub async fn submit(
        &self,
        request: String,
        target_agent_id: Option<String>,
        target_role: Option<String>,
        skip_approval: bool,
    ) -> Task {
        let task = self.tasks.create(request, now_ms()).await;
        let this = self.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move {
            this.plan_and_gate(&task_id, target_agent_id, target_role, skip_approval).await;
        });
        task
    }

    async fn plan_and_gate(
        &self,
        task_id: &str,
        target_agent_id: Option<String>,
        target_role: Option<String>,
        skip_approval: bool,
    ) {
        if self.tasks.transition(task_id, TaskEvent::StartPlanning, now_ms(), |_| {}).await.is_err() {
            return;
        }

        let task = match self.tasks.get(task_id).await {
            Ok(task) => task,
            Err(_) => return,
        };
        let agents = self.registry.list().await;

        let mut plan = match self.planner.plan(&task.request, &agents).await {
            Ok(plan) => plan,
            Err(err) => {
                let detail = match &err {
                    PlannerError::PlannerFormatError(raw) => {
                        let truncated: String = raw.chars().take(4000).collect();
                        record_audit_event(
                            tracing::Level::WARN,
                            AuditEvent {
                                event: "plan_failed",
                                task_id: Some(task_id),
                                agent_id: None,
                                command_index: None,
                                status: Some("failed"),
                                detail: Some(&truncated),
                            },
                        );
                        "PlannerFormatError".to_string()
                    }
                    other => format!("PlannerFormatError: {other}"),
                };
                let _ = self
                    .tasks
                    .transition(task_id, TaskEvent::PlanFailed, now_ms(), |t| t.error = Some(detail))
                    .await;
                return;
            }
        };

        if plan.target_agent_id.is_none() {
            plan.target_agent_id = target_agent_id;
        }
        if plan.target_role.is_none() {
            plan.target_role = target_role;
        }

        if let Some(invalid) = plan.commands.iter().find_map(|c| c.validate().err()) {
            tracing::warn!(task_id, error = %invalid, "plan rejected: invalid command");
            let _ = self
                .tasks
                .transition(task_id, TaskEvent::PlanFailed, now_ms(), |t| {
                    t.error = Some(format!("ValidationError: {invalid}"));
                })
                .await;
            return;
        }

        let mut worst = Verdict::AutoApprove;
        let mut reasons = Vec::new();
        for command in &plan.commands {
            let classification = self.validator.classify(&command.run);
            if classification.verdict > worst {
                worst = classification.verdict;
            }
            reasons.extend(classification.reasons);
        }

        if worst == Verdict::Deny {
            // Log-only redaction policy (spec.md §9): never echo the offending
            // command verbatim back to the HTTP caller.
            tracing::warn!(task_id, reasons = ?reasons, "plan denied by safety validator");
            let _ = self
                .tasks
                .transition(task_id, TaskEvent::PlanFailed, now_ms(), |t| {
                    t.error = Some("SafetyDenied: plan contains a denied command".to_string());
                })
                .await;
            return;
        }

        plan.risk_level = consistent_risk_level(worst, plan.risk_level);
        let requires_approval = !skip_approval
            && (worst == Verdict::RequiresApproval || plan.requires_approval || plan.risk_level >= RiskLevel::Medium);
        plan.requires_approval = requires_approval;

        let event = TaskEvent::PlanReady { requires_approval };
        let result = self
            .tasks
            .transition(task_id, event, now_ms(), |t| t.plan = Some(plan))
            .await;

        if let Ok(task) = result {
            if task.status == TaskStatus::Ready {
                self.dispatcher.spawn(task.id);
            }
        }
    }

    pub async fn approve(
        &self,
        task_id: &str,
        approved: bool,
        reason: Option<String>,
        actor: Option<String>,
    ) -> Result<Task, TaskStoreError> {
        let task = self.tasks.approve(task_id, approved, reason, actor, now_ms()).await?;
        if task.status == TaskStatus::Ready {
            self.dispatcher.spawn(task.id.clone());
        }
        Ok(task)
    }

    pub async fn cancel(&self, task_id: &str) -> Result<Task, TaskStoreError> {
        self.dispatcher.request_cancel(task_id).await;
        self.tasks.cancel(task_id, now_ms()).await
    }
}

fn consistent_risk_level(verdict: Verdict, planner_risk: RiskLevel) -> RiskLevel {
    let floor = match verdict {
        Verdict::AutoApprove => RiskLevel::Low,
        Verdict::RequiresApproval => RiskLevel::Medium,
        Verdict::Deny => RiskLevel::High,
    };
    planner_risk.max(floor)
}
