//! Statistics query endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};

use super::routes::AppState;
use super::types::ApiError;

/// Create the statistics routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(overview))
        .route("/summary", get(summary))
        .route("/daily", get(daily))
        .route("/range", get(range))
        .route("/models", get(models))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: String,
    pub end: String,
}

/// GET /api/statistics/summary
async fn summary(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let summary = state.collector.summary().await?;
    Ok(Json(json!({ "success": true, "summary": summary })))
}

/// GET /api/statistics/daily?limit=
async fn daily(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let daily = state.collector.daily(query.limit).await?;
    Ok(Json(json!({
        "success": true,
        "count": daily.len(),
        "daily": daily,
    })))
}

/// GET /api/statistics/range?start=YYYY-MM-DD&end=YYYY-MM-DD
async fn range(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Value>, ApiError> {
    let start = parse_date(&query.start)?;
    let end = parse_date(&query.end)?;
    if end < start {
        return Err(ApiError::bad_request("end must not be before start"));
    }

    let days = state.collector.range(start, end).await?;
    Ok(Json(json!({
        "success": true,
        "count": days.len(),
        "daily": days,
    })))
}

/// GET /api/statistics/models?limit=
async fn models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let models = state.collector.top_models(query.limit.unwrap_or(10)).await?;
    let models: Vec<Value> = models
        .into_iter()
        .map(|(model, counters)| {
            json!({
                "model": model,
                "count": counters.count,
                "cost_usd": counters.cost_usd,
            })
        })
        .collect();
    Ok(Json(json!({ "success": true, "models": models })))
}

/// GET /api/statistics/
/// Combined overview: summary, recent days, top models.
async fn overview(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let summary = state.collector.summary().await?;
    let daily = state.collector.daily(Some(7)).await?;
    let models = state.collector.top_models(5).await?;
    let models: Vec<Value> = models
        .into_iter()
        .map(|(model, counters)| {
            json!({
                "model": model,
                "count": counters.count,
                "cost_usd": counters.cost_usd,
            })
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "summary": summary,
        "daily": daily,
        "models": models,
    })))
}

fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("invalid date: {raw} (expected YYYY-MM-DD)")))
}
