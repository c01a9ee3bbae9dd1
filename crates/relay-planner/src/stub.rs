use async_trait::async_trait;
use relay_types::{Agent, Command, Plan, RiskLevel, WorkspaceType};

use crate::{Planner, PlannerError};

/// Deterministic keyword-heuristic planner used whenever no LLM
/// credentials are configured. Never fails.
pub struct StubPlanner;

#[async_trait]
impl Planner for StubPlanner {
    async fn plan(&self, request: &str, _agents: &[Agent]) -> Result<Plan, PlannerError> {
        let lower = request.to_lowercase();

        let (steps, commands, risk_level): (Vec<String>, Vec<Command>, RiskLevel) =
            if lower.contains("update") || lower.contains("pull") {
                (
                    vec!["Pull the latest changes in the workspace".to_string()],
                    vec![Command::new(".", "git pull origin main")],
                    RiskLevel::Low,
                )
            } else if lower.contains("status") || lower.contains("check") {
                (
                    vec![
                        "Report host uptime".to_string(),
                        "List running services".to_string(),
                    ],
                    vec![Command::new(
                        ".",
                        "uptime && systemctl list-units --type=service --state=running",
                    )],
                    RiskLevel::Low,
                )
            } else if lower.contains("deploy") {
                (
                    vec![
                        "Pull the latest changes".to_string(),
                        "Install dependencies".to_string(),
                        "Restart the service".to_string(),
                    ],
                    vec![Command::new(
                        ".",
                        "git pull origin main && pip install -r requirements.txt && systemctl restart app",
                    )],
                    RiskLevel::Medium,
                )
            } else {
                (
                    vec!["No heuristic matched; report host status".to_string()],
                    vec![Command::new(".", "uptime")],
                    RiskLevel::Low,
                )
            };

        Ok(Plan {
            target_agent_id: None,
            target_role: None,
            workspace: "default".to_string(),
            workspace_type: WorkspaceType::Bare,
            steps,
            reasoning: format!("stub planner matched request `{request}` on keyword heuristics"),
            risk_level,
            requires_approval: false,
            commands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_request_maps_to_git_pull() {
        let plan = StubPlanner.plan("please update the web service", &[]).await.unwrap();
        assert_eq!(plan.commands.len(), 1);
        assert_eq!(plan.commands[0].run, "git pull origin main");
    }

    #[tokio::test]
    async fn status_request_maps_to_uptime_and_systemctl() {
        let plan = StubPlanner.plan("can you check the status", &[]).await.unwrap();
        assert!(plan.commands[0].run.contains("uptime"));
        assert!(plan.commands[0].run.contains("systemctl list-units"));
    }

    #[tokio::test]
    async fn deploy_request_chains_pull_install_restart() {
        let plan = StubPlanner.plan("deploy the latest build", &[]).await.unwrap();
        let run = &plan.commands[0].run;
        assert!(run.contains("git pull"));
        assert!(run.contains("pip install"));
        assert!(run.contains("systemctl restart"));
        assert_eq!(plan.risk_level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn stub_planner_never_fails() {
        assert!(StubPlanner.plan("", &[]).await.is_ok());
        assert!(StubPlanner.plan("gibberish unrelated text", &[]).await.is_ok());
    }
}
