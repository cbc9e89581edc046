use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health: liveness plus store backend, active job and redacted config.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let active_job = match state.refresh.active_job().await {
        Ok(job) => json!(job.map(|j| j.id)),
        Err(e) => json!({ "error": e.to_string() }),
    };
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "store": state.refresh.backend(),
        "active_job": active_job,
        "config": state.config_summary,
    }))
}
