use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use relay_core::TaskStoreError;
use relay_orchestrator::InvalidTransition;
use relay_types::Task;
use relay_wire::{AgentCounts, ApproveTaskRequest, CreateTaskRequest, ErrorBody, HealthResponse, ListTasksQuery};

use crate::{ws_agent, ws_client, AppState};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/agents", get(list_agents))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/approve", post(approve_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/ws/client", get(ws_client_upgrade))
        .route("/ws/agent", get(ws_agent_upgrade))
        .layer(cors)
        .with_state(state)
}

/// Uniform error envelope for every non-2xx response (spec.md §7).
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody::new(self.1))).into_response()
    }
}

impl From<TaskStoreError> for ApiError {
    fn from(err: TaskStoreError) -> Self {
        match err {
            TaskStoreError::NotFound(id) => ApiError(StatusCode::NOT_FOUND, format!("no task with id `{id}`")),
            TaskStoreError::InvalidTransition(InvalidTransition { from, event }) => ApiError(
                StatusCode::CONFLICT,
                format!("cannot apply {event:?} to a task in {from:?}"),
            ),
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let agents = state.orchestrator.registry.list().await;
    let total = agents.len();
    let online = agents.iter().filter(|a| a.status.is_online()).count();
    let available = agents
        .iter()
        .filter(|a| a.status.is_online() && a.active_task_count == 0)
        .count();
    Json(HealthResponse {
        status: "ok",
        agents: AgentCounts { total, online, available },
        audit_write_failures: state.audit_write_failures.count(),
    })
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<relay_types::Agent>> {
    Json(state.orchestrator.registry.list().await)
}

async fn list_tasks(State(state): State<AppState>, Query(query): Query<ListTasksQuery>) -> Json<Vec<Task>> {
    Json(state.orchestrator.tasks.list(query.status, query.limit).await)
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.orchestrator.tasks.get(&id).await?))
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    if body.request.trim().is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "ValidationError: request must not be empty".to_string()));
    }
    let task = state
        .orchestrator
        .submit(body.request, body.target_agent_id, body.target_role, body.skip_approval)
        .await;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

async fn approve_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ApproveTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .orchestrator
        .approve(&id, body.approved, body.reason, None)
        .await?;
    Ok(Json(task))
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.orchestrator.cancel(&id).await?))
}

async fn ws_client_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ws_client::handle(socket, state))
}

async fn ws_agent_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ws_agent::handle(socket, state))
}
