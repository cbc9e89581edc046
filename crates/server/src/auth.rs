//! Request middleware for the refresh API.
//!
//! `require_token` gates the API behind the shared token when one is
//! configured. `auto_refresh` runs after it, so only authenticated requests
//! can trigger a staleness refresh.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::{info, warn};

use crate::api::error_response;
use crate::state::AppState;

pub const API_TOKEN_HEADER: &str = "x-api-token";

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer
        .or_else(|| headers.get(API_TOKEN_HEADER).and_then(|v| v.to_str().ok()))
        .map(str::trim)
}

pub async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(req).await;
    };
    if presented_token(req.headers()) == Some(expected) {
        return next.run(req).await;
    }
    warn!(path = %req.uri().path(), "rejected refresh API request without valid token");
    error_response(StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

/// Start a background refresh when the data is stale, then serve the request.
/// The request never waits for the pipeline.
pub async fn auto_refresh(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match state.refresh.auto_refresh_if_due(Utc::now()).await {
        Ok(Some(outcome)) if outcome.started => {
            info!(job_id = %outcome.job_id, path = %req.uri().path(), "auto-refresh started");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "auto-refresh check failed"),
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_presented_token_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(presented_token(&headers), None);

        headers.insert(API_TOKEN_HEADER, HeaderValue::from_static(" abc "));
        assert_eq!(presented_token(&headers), Some("abc"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(presented_token(&headers), Some("xyz"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(presented_token(&headers), Some("abc"));
    }
}
