//! Task queue endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::store::tasks::{NewTask, TaskFilter, TaskMetadata, TaskStatus};

use super::routes::AppState;
use super::types::ApiError;

/// Create the task routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/async", post(create_task))
        .route("/", get(list_tasks))
        .route("/queue/status", get(queue_status))
        .route("/:id", get(get_task).delete(cancel_task))
        .route("/:id/priority", axum::routing::patch(update_priority))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub prompt: String,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub mcp_config: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePriorityRequest {
    pub priority: u8,
}

/// POST /api/tasks/async
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt is required"));
    }
    if let Some(priority) = req.priority {
        if !(1..=10).contains(&priority) {
            return Err(ApiError::bad_request("priority must be between 1 and 10"));
        }
    }

    let (project_path, model) = {
        let config = state.config.read().await;
        (
            req.project_path
                .unwrap_or_else(|| config.default_project_path.clone()),
            req.model.unwrap_or_else(|| config.default_model.clone()),
        )
    };

    let task = state
        .queue
        .add_task(NewTask {
            prompt: req.prompt,
            project_path,
            model,
            priority: req.priority,
            metadata: TaskMetadata {
                webhook_url: req.webhook_url,
                session_id: req.session_id,
                system_prompt: req.system_prompt,
                max_budget_usd: req.max_budget_usd,
                allowed_tools: req.allowed_tools,
                disallowed_tools: req.disallowed_tools,
                agent: req.agent,
                mcp_config: req.mcp_config,
            },
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "task": task })),
    ))
}

/// GET /api/tasks
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some("pending") => Some(TaskStatus::Pending),
        Some("processing") => Some(TaskStatus::Processing),
        Some("completed") => Some(TaskStatus::Completed),
        Some("failed") => Some(TaskStatus::Failed),
        Some("cancelled") => Some(TaskStatus::Cancelled),
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "unknown task status: {other}"
            )))
        }
    };

    let tasks = state
        .tasks
        .list(TaskFilter {
            status,
            limit: query.limit,
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "count": tasks.len(),
        "tasks": tasks,
    })))
}

/// GET /api/tasks/:id
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .tasks
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;
    Ok(Json(json!({ "success": true, "task": task })))
}

/// PATCH /api/tasks/:id/priority
async fn update_priority(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdatePriorityRequest>,
) -> Result<Json<Value>, ApiError> {
    if !(1..=10).contains(&req.priority) {
        return Err(ApiError::bad_request("priority must be between 1 and 10"));
    }

    let existing = state
        .tasks
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;
    if existing.status.is_terminal() {
        return Err(ApiError::bad_request(format!(
            "task {id} is {} and cannot be reprioritized",
            existing.status
        )));
    }

    let task = state
        .tasks
        .set_priority(id, req.priority)
        .await?
        .ok_or_else(|| ApiError::bad_request(format!("task {id} cannot be reprioritized")))?;

    Ok(Json(json!({ "success": true, "task": task })))
}

/// DELETE /api/tasks/:id
/// Cancel a pending or processing task.
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let existing = state
        .tasks
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;

    match state.queue.cancel(id).await? {
        Some(task) => Ok(Json(json!({ "success": true, "task": task }))),
        None => Err(ApiError::bad_request(format!(
            "task {id} is {} and cannot be cancelled",
            existing.status
        ))),
    }
}

/// GET /api/tasks/queue/status
async fn queue_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let status = state.queue.status().await?;
    Ok(Json(json!({ "success": true, "queue": status })))
}
