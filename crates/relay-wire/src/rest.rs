use serde::{Deserialize, Serialize};

/// `POST /api/tasks` body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub request: String,
    #[serde(default)]
    pub target_agent_id: Option<String>,
    #[serde(default)]
    pub target_role: Option<String>,
    #[serde(default)]
    pub skip_approval: bool,
}

/// `POST /api/tasks/{id}/approve` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ApproveTaskRequest {
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `GET /health` response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub agents: AgentCounts,
    pub audit_write_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentCounts {
    pub total: usize,
    pub online: usize,
    pub available: usize,
}

/// `GET /api/tasks?status=&limit=` query parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<relay_types::TaskStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Uniform error body for every non-2xx REST response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl ErrorBody {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_task_request_defaults_skip_approval_to_false() {
        let req: CreateTaskRequest = serde_json::from_str(r#"{"request":"restart web1"}"#).unwrap();
        assert!(!req.skip_approval);
        assert!(req.target_agent_id.is_none());
    }

    #[test]
    fn error_body_serializes_with_detail_key() {
        let body = ErrorBody::new("task not found");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["detail"], "task not found");
    }
}
