//! Application state and router assembly.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::collector::{process_memory_bytes, StatisticsCollector};
use crate::config::SharedConfig;
use crate::executor::Executor;
use crate::queue::TaskQueue;
use crate::rate_limit::{self, RateLimiter};
use crate::store::sessions::SessionStore;
use crate::store::statistics::StatsStore;
use crate::store::tasks::TaskStore;
use crate::webhook::WebhookNotifier;

use super::{claude, sessions, statistics, tasks};

/// Shared application state.
pub struct AppState {
    pub config: SharedConfig,
    pub sessions: Arc<SessionStore>,
    pub tasks: Arc<TaskStore>,
    pub statistics: Arc<StatsStore>,
    pub queue: TaskQueue,
    pub webhooks: Arc<WebhookNotifier>,
    pub executor: Arc<dyn Executor>,
    pub collector: Arc<StatisticsCollector>,
    pub rate_limiter: RateLimiter,
}

/// Build the full router: `/health` unthrottled, everything under `/api`
/// behind the rate limiter.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/config", get(get_config))
        .nest("/claude", claude::routes())
        .nest("/sessions", sessions::routes())
        .nest("/tasks", tasks::routes())
        .nest("/statistics", statistics::routes())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime": state.collector.uptime_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "memory": {
            "rss_bytes": process_memory_bytes(),
        },
    }))
}

/// GET /api/config
/// Public subset of the live configuration.
async fn get_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.config.read().await;
    Json(json!({
        "success": true,
        "config": {
            "port": config.port,
            "host": config.host,
            "agentPath": config.agent_path,
            "defaultProjectPath": config.default_project_path,
            "dataDir": config.data_dir,
            "defaultModel": config.default_model,
            "sessionRetentionDays": config.session_retention_days,
            "taskQueue": config.task_queue,
            "rateLimit": config.rate_limit,
            "webhook": {
                "enabled": config.webhook.enabled,
                "timeout": config.webhook.timeout,
                "retries": config.webhook.retries,
                "hasDefaultUrl": config.webhook.default_url.is_some(),
            },
            "statistics": config.statistics,
            "maxBudgetUsd": config.max_budget_usd,
            "logLevel": config.log_level,
        },
    }))
}
