//! Session management endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::executor::ExecuteOptions;
use crate::store::sessions::{NewSession, SessionFilter, SessionPatch, SessionStatus};

use super::routes::AppState;
use super::types::ApiError;

/// Create the session routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_session).get(list_sessions))
        .route("/search", get(search_sessions))
        .route(
            "/:id",
            get(get_session).delete(delete_session),
        )
        .route("/:id/continue", post(continue_session))
        .route("/:id/status", axum::routing::patch(update_status))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ContinueRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
}

/// POST /api/sessions
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (project_path, model) = {
        let config = state.config.read().await;
        (
            req.project_path
                .unwrap_or_else(|| config.default_project_path.clone()),
            req.model.unwrap_or_else(|| config.default_model.clone()),
        )
    };

    let session = state
        .sessions
        .create(NewSession {
            project_path,
            model,
            metadata: req.metadata,
        })
        .await?;

    let webhooks = Arc::clone(&state.webhooks);
    let created = session.clone();
    tokio::spawn(async move {
        webhooks.session_created(&created).await;
    });

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "session": session })),
    ))
}

/// GET /api/sessions
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = parse_status(query.status.as_deref())?;
    let sessions = state
        .sessions
        .list(SessionFilter {
            status,
            project_path: query.project_path,
            limit: query.limit,
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

/// GET /api/sessions/search?q=&limit=
async fn search_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    if query.q.trim().is_empty() {
        return Err(ApiError::bad_request("query parameter q is required"));
    }
    let sessions = state.sessions.search(&query.q, query.limit).await?;
    Ok(Json(json!({
        "success": true,
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

/// GET /api/sessions/:id
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .sessions
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session {id} not found")))?;
    Ok(Json(json!({ "success": true, "session": session })))
}

/// POST /api/sessions/:id/continue
/// Append a turn to an existing session.
async fn continue_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ContinueRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt is required"));
    }

    let session = state
        .sessions
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session {id} not found")))?;
    if session.status != SessionStatus::Active {
        return Err(ApiError::internal(format!(
            "session {id} is {} and cannot be continued",
            session.status
        )));
    }

    let max_budget_usd = {
        let config = state.config.read().await;
        req.max_budget_usd.or(config.max_budget_usd)
    };

    let outcome = state
        .executor
        .execute(ExecuteOptions {
            prompt: req.prompt,
            project_path: session.project_path.clone(),
            model: req.model.unwrap_or(session.model),
            session_id: Some(id),
            system_prompt: req.system_prompt,
            max_budget_usd,
            ..Default::default()
        })
        .await;

    let status = if outcome.success || outcome.budget_exceeded {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(serde_json::to_value(outcome).unwrap_or_default())))
}

/// PATCH /api/sessions/:id/status
async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<Value>, ApiError> {
    let status: SessionStatus = req
        .status
        .parse()
        .map_err(|err: String| ApiError::bad_request(err))?;

    let session = state
        .sessions
        .update(
            id,
            SessionPatch {
                status: Some(status),
                ..Default::default()
            },
        )
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session {id} not found")))?;

    Ok(Json(json!({ "success": true, "session": session })))
}

/// DELETE /api/sessions/:id
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if !state.sessions.delete(id).await? {
        return Err(ApiError::not_found(format!("session {id} not found")));
    }

    let webhooks = Arc::clone(&state.webhooks);
    tokio::spawn(async move {
        webhooks.session_deleted(id).await;
    });

    Ok(Json(json!({ "success": true, "deleted": id })))
}

fn parse_status(raw: Option<&str>) -> Result<Option<SessionStatus>, ApiError> {
    match raw {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|err: String| ApiError::bad_request(err)),
    }
}
