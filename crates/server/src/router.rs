//! HTTP router construction.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::state::AppState;
use crate::{api, auth};

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::permissive();
    }
    match HeaderValue::from_str(origin) {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(e) => {
            warn!(origin = %origin, error = %e, "invalid CORS_ORIGIN, allowing any origin");
            CorsLayer::permissive()
        }
    }
}

/// Build the application router. `/health` is public; the refresh API sits
/// behind the token gate and then the auto-refresh check.
pub fn build_router(state: Arc<AppState>) -> Router {
    let refresh_api = Router::new()
        .route("/api/refresh/start/", post(api::refresh_start))
        .route("/api/refresh/status/", get(api::refresh_status))
        .route("/api/refresh/cancel/", post(api::refresh_cancel))
        .route("/api/refresh/current/", get(api::refresh_current))
        .route("/api/refresh/history/", get(api::refresh_history))
        // Added first, so it runs after the token check.
        .layer(middleware::from_fn_with_state(state.clone(), auth::auto_refresh))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .route("/health", get(api::health))
        .merge(refresh_api)
        .layer(cors_layer(&state.cors_origin))
        .with_state(state)
}
