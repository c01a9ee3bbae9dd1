pub mod client;
pub mod stub;

use async_trait::async_trait;
use relay_types::{Agent, Plan};

pub use client::{client_from_env, CompletionClient};
pub use stub::StubPlanner;

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("vendor request failed: {0}")]
    Transport(String),
    #[error("vendor returned an error: {0}")]
    Vendor(String),
    /// Carries the raw, still-unparseable reply from the correction retry so
    /// callers can audit-log what the vendor actually sent.
    #[error("planner reply was not valid JSON after a correction retry")]
    PlannerFormatError(String),
}

/// Abstract capability: translate a natural-language request, given the
/// current agent inventory, into a structured `Plan`.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &str, agents: &[Agent]) -> Result<Plan, PlannerError>;
}

/// Delegates to an external LLM via a `CompletionClient`. Feeds it the
/// agent inventory and the `Plan` JSON schema, parses the reply (accepting
/// fenced JSON), and retries once with a correction prompt on parse
/// failure before giving up.
pub struct LivePlanner {
    client: Box<dyn CompletionClient>,
}

impl LivePlanner {
    pub fn new(client: Box<dyn CompletionClient>) -> Self {
        Self { client }
    }

    fn system_prompt(&self, agents: &[Agent]) -> String {
        let inventory = if agents.is_empty() {
            "(no agents are currently connected)".to_string()
        } else {
            agents
                .iter()
                .map(|a| {
                    format!(
                        "- id={} hostname={} status={:?} roles={:?} tags={:?} capabilities={:?}",
                        a.id, a.hostname, a.status, a.roles, a.tags, a.capabilities
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "You are the planning component of a task-orchestration controller. \
             Given a user request, produce a single JSON object matching this schema:\n\
             {}\n\n\
             Connected agents:\n{}\n\n\
             Reply with exactly one JSON object, optionally inside a ```json fenced block. \
             Do not include any other commentary.",
            relay_wire::PLAN_JSON_SCHEMA,
            inventory
        )
    }
}

#[async_trait]
impl Planner for LivePlanner {
    async fn plan(&self, request: &str, agents: &[Agent]) -> Result<Plan, PlannerError> {
        let system_prompt = self.system_prompt(agents);
        let reply = self.client.complete(&system_prompt, request).await?;

        if let Some(plan) = parse_plan_reply(&reply) {
            return Ok(plan);
        }

        tracing::warn!("planner reply was not valid JSON, retrying with a correction prompt");
        let correction = format!(
            "Your previous reply was not valid JSON matching the schema. \
             Reply again with exactly one JSON object and nothing else.\n\nPrevious reply:\n{reply}"
        );
        let retry_reply = self.client.complete(&system_prompt, &correction).await?;

        parse_plan_reply(&retry_reply).ok_or_else(|| PlannerError::PlannerFormatError(retry_reply))
    }
}

/// Strips a ```json fenced block (or a bare ``` fence) if present, then
/// parses the remainder as a `Plan`.
fn parse_plan_reply(reply: &str) -> Option<Plan> {
    let trimmed = reply.trim();
    let candidate = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim_end_matches("```").trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_end_matches("```").trim()
    } else {
        trimmed
    };
    serde_json::from_str(candidate).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json_reply() {
        let reply = r#"{"workspace":"repo","workspace_type":"bare","steps":[],"reasoning":"",
            "risk_level":"low","requires_approval":false,"commands":[]}"#;
        assert!(parse_plan_reply(reply).is_some());
    }

    #[test]
    fn parses_fenced_json_reply() {
        let reply = "```json\n{\"workspace\":\"repo\",\"workspace_type\":\"bare\",\"steps\":[],\"reasoning\":\"\",\"risk_level\":\"low\",\"requires_approval\":false,\"commands\":[]}\n```";
        assert!(parse_plan_reply(reply).is_some());
    }

    #[test]
    fn rejects_non_json_reply() {
        assert!(parse_plan_reply("sure thing, here's a plan in prose").is_none());
    }
}
