//! Sync and async agent execution endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::executor::ExecuteOptions;
use crate::store::sessions::NewSession;
use crate::store::tasks::{NewTask, TaskMetadata};

use super::routes::AppState;
use super::types::ApiError;

/// Create the execution routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(execute))
        .route("/batch", post(execute_batch))
}

/// Request body for `POST /api/claude`.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub prompt: String,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
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
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    /// When true the request is queued and answered with 202.
    #[serde(default, rename = "async")]
    pub run_async: bool,
}

/// Request body for `POST /api/claude/batch`.
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub prompts: Vec<String>,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
}

/// Maximum prompts accepted by one batch request.
const BATCH_LIMIT: usize = 10;

/// POST /api/claude
/// Execute a prompt inline, or queue it when `async` is set.
async fn execute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt is required"));
    }
    let (project_path, model, max_budget_usd) = {
        let config = state.config.read().await;
        (
            req.project_path
                .clone()
                .unwrap_or_else(|| config.default_project_path.clone()),
            req.model.clone().unwrap_or_else(|| config.default_model.clone()),
            req.max_budget_usd.or(config.max_budget_usd),
        )
    };

    let session_id = resolve_session(&state, req.session_id, &project_path, &model).await?;

    if req.run_async {
        let task = state
            .queue
            .add_task(NewTask {
                prompt: req.prompt,
                project_path,
                model,
                priority: req.priority,
                metadata: TaskMetadata {
                    webhook_url: req.webhook_url,
                    session_id: Some(session_id),
                    system_prompt: req.system_prompt,
                    max_budget_usd,
                    allowed_tools: req.allowed_tools,
                    disallowed_tools: req.disallowed_tools,
                    agent: req.agent,
                    mcp_config: req.mcp_config,
                },
            })
            .await?;

        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "task_id": task.id,
                "status": task.status,
                "session_id": session_id,
            })),
        ));
    }

    let outcome = state
        .executor
        .execute(ExecuteOptions {
            prompt: req.prompt,
            project_path,
            model,
            session_id: Some(session_id),
            system_prompt: req.system_prompt,
            max_budget_usd,
            allowed_tools: req.allowed_tools,
            disallowed_tools: req.disallowed_tools,
            agent: req.agent,
            mcp_config: req.mcp_config,
        })
        .await;

    // Budget stops are signalled in-band; other failures are 500s.
    let status = if outcome.success || outcome.budget_exceeded {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(serde_json::to_value(outcome).unwrap_or_default())))
}

/// POST /api/claude/batch
/// Execute up to ten prompts concurrently.
async fn execute_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.prompts.is_empty() {
        return Err(ApiError::bad_request("prompts must not be empty"));
    }
    if req.prompts.len() > BATCH_LIMIT {
        return Err(ApiError::bad_request(format!(
            "at most {BATCH_LIMIT} prompts per batch"
        )));
    }
    if req.prompts.iter().any(|p| p.trim().is_empty()) {
        return Err(ApiError::bad_request("prompts must not be blank"));
    }

    let (project_path, model, max_budget_usd) = {
        let config = state.config.read().await;
        (
            req.project_path
                .clone()
                .unwrap_or_else(|| config.default_project_path.clone()),
            req.model.clone().unwrap_or_else(|| config.default_model.clone()),
            req.max_budget_usd.or(config.max_budget_usd),
        )
    };

    let executions = req.prompts.into_iter().map(|prompt| {
        let state = Arc::clone(&state);
        let project_path = project_path.clone();
        let model = model.clone();
        let system_prompt = req.system_prompt.clone();
        async move {
            state
                .executor
                .execute(ExecuteOptions {
                    prompt,
                    project_path,
                    model,
                    session_id: req.session_id,
                    system_prompt,
                    max_budget_usd,
                    ..Default::default()
                })
                .await
        }
    });

    let results = join_all(executions).await;
    let success = results.iter().all(|r| r.success);
    Ok(Json(json!({
        "success": success,
        "results": results,
    })))
}

/// Use the supplied session (404 when unknown) or auto-create one so cost
/// and message counters always have somewhere to land.
async fn resolve_session(
    state: &Arc<AppState>,
    session_id: Option<Uuid>,
    project_path: &str,
    model: &str,
) -> Result<Uuid, ApiError> {
    if let Some(id) = session_id {
        return match state.sessions.get(id).await? {
            Some(_) => Ok(id),
            None => Err(ApiError::not_found(format!("session {id} not found"))),
        };
    }

    let session = state
        .sessions
        .create(NewSession {
            project_path: project_path.to_string(),
            model: model.to_string(),
            metadata: Default::default(),
        })
        .await?;
    tracing::debug!("Auto-created session {} for request", session.id);

    let webhooks = Arc::clone(&state.webhooks);
    let created = session.clone();
    tokio::spawn(async move {
        webhooks.session_created(&created).await;
    });

    Ok(session.id)
}
