//! HTTP handlers.
//!
//! Shared response helpers live here; each sub-module owns one area.

mod health;
mod refresh;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use korsync_refresh::RefreshError;

pub use health::health;
pub use refresh::{refresh_cancel, refresh_current, refresh_history, refresh_start, refresh_status};

pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "ok": false, "error": message.into() })))
}

/// Map a service error. Only `NotFound` is a client error.
pub(crate) fn refresh_error(e: RefreshError) -> ApiError {
    match e {
        RefreshError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "Job not found"),
        other => {
            error!(error = %other, "refresh request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

/// Serialize `value` as an object and add `"ok": true` next to its fields.
pub(crate) fn ok_with<T: Serialize>(value: &T) -> Result<Json<Value>, ApiError> {
    let mut body = serde_json::to_value(value)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    match body.as_object_mut() {
        Some(map) => {
            map.insert("ok".to_string(), Value::Bool(true));
            Ok(Json(body))
        }
        None => Ok(Json(json!({ "ok": true, "data": body }))),
    }
}
