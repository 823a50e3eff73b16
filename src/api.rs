//! REST management surface.
//!
//! Creation endpoints are also dispatch triggers: creating a project or a
//! task immediately tries to hand the new pending work to live agents, so in
//! steady state no polling loop is needed.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::completion::CompletionPolicy;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{Error, StoreError};
use crate::generate::{self, Generator};
use crate::model::{Agent, Project, Task};
use crate::queue::{TASK_QUEUE, WorkQueue};
use crate::store::TaskStore;

/// Shared state for the REST routes.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub generator: Arc<dyn Generator>,
    pub dispatcher: Arc<Dispatcher>,
    pub completion_policy: CompletionPolicy,
    pub liveness_window: Duration,
}

/// Error wrapper translating domain errors to HTTP responses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(Error::Store(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Store(StoreError::StatusConflict { .. }) => StatusCode::CONFLICT,
            _ => {
                error!(error = %self.0, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct CreateProjectResponse {
    project_id: Uuid,
    task_count: usize,
    message: &'static str,
}

/// POST /project
///
/// Create a project, expand its description into tasks with the generator,
/// and dispatch whatever can be dispatched right away.
async fn create_project(
    State(state): State<ApiState>,
    Json(body): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.trim().is_empty() || body.description.trim().is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Name and description are required"})),
        )
            .into_response());
    }

    let project = state
        .store
        .create_project(body.name.trim(), body.description.trim())
        .await?;

    let prompt = generate::breakdown_prompt(&project.name, &project.description);
    let response = state.generator.generate(&prompt).await.map_err(|e| {
        error!(project_id = %project.id, error = %e, "Task breakdown failed");
        ApiError(e.into())
    })?;

    let descriptions = generate::parse_task_lines(&response);
    info!(
        project_id = %project.id,
        tasks = descriptions.len(),
        "Project expanded into tasks"
    );

    for description in &descriptions {
        state
            .store
            .create_task(Some(project.id), description)
            .await?;
    }

    let report = state.dispatcher.dispatch_project(project.id).await?;
    info!(
        project_id = %project.id,
        assigned = report.assigned,
        deferred = report.deferred,
        "Initial project dispatch done"
    );

    Ok((
        StatusCode::CREATED,
        Json(
            serde_json::to_value(CreateProjectResponse {
                project_id: project.id,
                task_count: descriptions.len(),
                message: "Project created successfully",
            })
            .unwrap_or_default(),
        ),
    )
        .into_response())
}

#[derive(Debug, Serialize)]
struct ProjectView {
    project: Project,
    tasks: Vec<Task>,
    /// Tasks still counting against completion under the configured policy.
    remaining: u64,
}

/// GET /project/{id}
async fn get_project(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(project) = state.store.get_project(id).await? else {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Project not found"})),
        )
            .into_response());
    };
    let tasks = state.store.list_tasks_for_project(id).await?;
    let remaining = state
        .store
        .remaining_for_project(id, state.completion_policy)
        .await?;
    Ok(Json(
        serde_json::to_value(ProjectView {
            project,
            tasks,
            remaining,
        })
        .unwrap_or_default(),
    )
    .into_response())
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    description: String,
    #[serde(default)]
    project_id: Option<Uuid>,
}

/// POST /task
///
/// Create one task, standalone or inside an existing project, and trigger a
/// dispatch pass.
async fn create_task(
    State(state): State<ApiState>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.description.trim().is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Description is required"})),
        )
            .into_response());
    }

    if let Some(project_id) = body.project_id {
        if state.store.get_project(project_id).await?.is_none() {
            return Ok((
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Project not found"})),
            )
                .into_response());
        }
    }

    let task = state
        .store
        .create_task(body.project_id, body.description.trim())
        .await?;
    let report = state.dispatcher.dispatch_pending().await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "task_id": task.id,
            "dispatched": report.assigned > 0,
        })),
    )
        .into_response())
}

/// POST /task/{id}/requeue
///
/// Return a failed task to `pending` for another attempt and trigger a
/// dispatch pass. Only valid from `failed`; anything else is a conflict.
async fn requeue_task(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.requeue_failed(id).await?;
    info!(task_id = %id, "Task requeued");
    let report = state.dispatcher.dispatch_pending().await?;
    Ok(Json(json!({
        "task_id": id,
        "dispatched": report.assigned > 0,
    })))
}

/// POST /dispatch
///
/// Explicit re-dispatch trigger: runs the recovery sweep and tries every
/// pending task once.
async fn dispatch(State(state): State<ApiState>) -> Result<Json<DispatchView>, ApiError> {
    let report = state.dispatcher.dispatch_pending().await?;
    Ok(Json(DispatchView::from(report)))
}

#[derive(Debug, Serialize)]
struct DispatchView {
    assigned: usize,
    deferred: usize,
    failed: usize,
    recovered: usize,
}

impl From<DispatchReport> for DispatchView {
    fn from(r: DispatchReport) -> Self {
        Self {
            assigned: r.assigned,
            deferred: r.deferred,
            failed: r.failed,
            recovered: r.recovered,
        }
    }
}

#[derive(Debug, Serialize)]
struct AgentView {
    #[serde(flatten)]
    agent: Agent,
    /// Heartbeat freshness against the liveness window. A stale agent still
    /// shows its stored status, but is never selectable for dispatch.
    live: bool,
}

#[derive(Debug, Serialize)]
struct AgentsView {
    agents: Vec<AgentView>,
}

/// GET /agents
async fn list_agents(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let now = chrono::Utc::now();
    let agents = state
        .store
        .list_agents()
        .await?
        .into_iter()
        .map(|agent| AgentView {
            live: agent.is_live(state.liveness_window, now),
            agent,
        })
        .collect();
    Ok(Json(serde_json::to_value(AgentsView { agents }).unwrap_or_default()))
}

/// GET /health
///
/// Per-component probes; 200 when everything passes, 503 with the same body
/// shape when degraded.
async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let store_status = match state.store.list_agents().await {
        Ok(_) => "healthy".to_string(),
        Err(e) => format!("unhealthy: {e}"),
    };
    let queue_status = match state.queue.declare(TASK_QUEUE).await {
        Ok(()) => "healthy".to_string(),
        Err(e) => format!("unhealthy: {e}"),
    };
    let generator_status = match state.generator.check().await {
        Ok(()) => "healthy".to_string(),
        Err(e) => format!("unhealthy: {e}"),
    };

    let healthy = [&store_status, &queue_status, &generator_status]
        .iter()
        .all(|s| *s == "healthy");

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "components": {
            "store": store_status,
            "queue": queue_status,
            "generator": generator_status,
        },
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Build the management REST routes.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/project", post(create_project))
        .route("/project/{id}", get(get_project))
        .route("/task", post(create_task))
        .route("/task/{id}/requeue", post(requeue_task))
        .route("/dispatch", post(dispatch))
        .route("/agents", get(list_agents))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
