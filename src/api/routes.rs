//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::alert::AlertStore;
use crate::api::state::AppState;
use crate::fusion::store::AnomalyQuery;
use crate::fusion::{AnomalyStatus, AnomalyStore};
use crate::notify::NotificationQueue;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/anomalies", get(list_anomalies))
        .route("/anomalies/{id}/resolve", post(resolve_anomaly))
        .route("/alerts", get(list_alerts))
        .route("/rules", get(list_rules))
        .route("/deadletter", get(list_dead_letters))
        .route("/deadletter/{id}/replay", post(replay_dead_letter))
        .route("/scan", post(trigger_scan))
}

/// Uniform error shape for the operational surface.
struct ApiError(StatusCode, String);

impl ApiError {
    fn internal(e: impl std::fmt::Display) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }

    fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.into())
    }

    fn not_found(msg: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn health() -> Json<Value> {
    envelope(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct AnomalyParams {
    entity: Option<String>,
    status: Option<String>,
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
}

async fn list_anomalies(
    State(state): State<AppState>,
    Query(params): Query<AnomalyParams>,
) -> Result<Json<Value>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(|s| s.parse::<AnomalyStatus>())
        .transpose()
        .map_err(ApiError::bad_request)?;
    let from = parse_day(params.from.as_deref()).map_err(ApiError::bad_request)?;
    let to = parse_day(params.to.as_deref()).map_err(ApiError::bad_request)?;

    let query = AnomalyQuery {
        entity: params.entity,
        status,
        from,
        to,
        limit: params.limit.unwrap_or(100),
    };

    let pool = state.pool.clone();
    let anomalies = tokio::task::spawn_blocking(move || AnomalyStore::new(pool).list(&query))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;

    let total = anomalies.len();
    Ok(envelope(json!({
        "anomalies": anomalies,
        "total": total
    })))
}

async fn resolve_anomaly(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let resolved = tokio::task::spawn_blocking(move || AnomalyStore::new(pool).force_resolve(id))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;

    if !resolved {
        return Err(ApiError::not_found("anomaly not found or already resolved"));
    }
    Ok(envelope(json!({ "resolved": id })))
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let limit = params.limit.unwrap_or(100);
    let alerts = tokio::task::spawn_blocking(move || AlertStore::new(pool).list_recent(limit))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;

    let total = alerts.len();
    Ok(envelope(json!({
        "alerts": alerts,
        "total": total
    })))
}

async fn list_rules(State(state): State<AppState>) -> Json<Value> {
    let rule_set = state.pipeline.rule_engine().rule_set();
    envelope(json!({
        "rules": &rule_set.rules,
        "rejected": &rule_set.rejected
    }))
}

async fn list_dead_letters(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let dead = tokio::task::spawn_blocking(move || NotificationQueue::new(pool).dead_letters())
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;

    let total = dead.len();
    Ok(envelope(json!({
        "jobs": dead,
        "total": total
    })))
}

async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let replayed = tokio::task::spawn_blocking(move || NotificationQueue::new(pool).replay(id))
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::internal)?;

    if !replayed {
        return Err(ApiError::not_found("job not found or not dead-lettered"));
    }
    Ok(envelope(json!({ "replayed": id })))
}

async fn trigger_scan(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let summary = state
        .pipeline
        .run_scan(Utc::now().date_naive(), &state.cancel)
        .await
        .map_err(ApiError::internal)?;

    Ok(envelope(serde_json::to_value(&summary).map_err(ApiError::internal)?))
}

fn parse_day(s: Option<&str>) -> Result<Option<NaiveDate>, String> {
    s.map(|v| {
        NaiveDate::parse_from_str(v, "%Y-%m-%d").map_err(|_| format!("bad date '{v}', expected YYYY-MM-DD"))
    })
    .transpose()
}
