//! Refresh job endpoints: start, status, cancel, current overview, history.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use korsync_refresh::{CancelOutcome, TriggerKind};

use crate::state::AppState;

use super::{error_response, ok_with, refresh_error, ApiError};

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    /// Monthly sales lookback; the configured default when absent.
    pub days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobQuery {
    pub job: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub job: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// POST /api/refresh/start/: start a refresh, or report the one already running.
pub async fn refresh_start(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartRequest>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let days = body.and_then(|Json(req)| req.days);
    if days == Some(0) {
        return Err(error_response(StatusCode::BAD_REQUEST, "days must be at least 1"));
    }

    let outcome = state
        .refresh
        .start(TriggerKind::Manual, days)
        .await
        .map_err(refresh_error)?;
    let status = if outcome.started {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(json!({ "ok": true, "job": outcome.job_id, "started": outcome.started })),
    ))
}

/// GET /api/refresh/status/?job=<id>
pub async fn refresh_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobQuery>,
) -> Result<Json<Value>, ApiError> {
    let raw = query
        .job
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Missing job id"))?;
    // Ids are opaque: a malformed one is just a job that does not exist.
    let id = Uuid::parse_str(raw.trim())
        .map_err(|_| error_response(StatusCode::NOT_FOUND, "Job not found"))?;

    let job = state.refresh.status(id).await.map_err(refresh_error)?;
    ok_with(&job)
}

/// POST /api/refresh/cancel/: request cancellation of `job` (query or body),
/// or of the active job when none is named.
pub async fn refresh_cancel(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobQuery>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<Value>, ApiError> {
    let named = query
        .job
        .or_else(|| body.and_then(|Json(req)| req.job))
        .filter(|s| !s.trim().is_empty());

    let (job, outcome) = match named {
        Some(raw) => match Uuid::parse_str(raw.trim()) {
            Ok(id) => (Some(id), state.refresh.cancel(id).await.map_err(refresh_error)?),
            Err(_) => {
                warn!(job = %raw, "cancel requested for malformed job id");
                (None, CancelOutcome::Unknown)
            }
        },
        None => state.refresh.cancel_active().await.map_err(refresh_error)?,
    };

    Ok(Json(json!({ "ok": true, "job": job, "outcome": outcome })))
}

/// GET /api/refresh/current/: active job, last success and next auto-refresh.
pub async fn refresh_current(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let overview = state
        .refresh
        .overview(Utc::now())
        .await
        .map_err(refresh_error)?;
    ok_with(&overview)
}

/// GET /api/refresh/history/?limit=N: most recent finished jobs, newest first.
pub async fn refresh_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let Some(history) = state.refresh.history().cloned() else {
        return Ok(Json(json!({ "ok": true, "jobs": [] })));
    };
    let jobs = tokio::task::spawn_blocking(move || history.recent(limit))
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({ "ok": true, "jobs": jobs })))
}
