use korsync_refresh::RefreshService;

/// Shared state for every handler and middleware.
pub struct AppState {
    pub refresh: RefreshService,
    /// Shared token for the refresh API. `None` leaves the API open.
    pub api_token: Option<String>,
    pub cors_origin: String,
    /// Redacted config view for `/health`.
    pub config_summary: serde_json::Value,
}

impl AppState {
    pub fn new(refresh: RefreshService, config: &korsync_core::Config) -> Self {
        Self {
            refresh,
            api_token: config.auth.api_token.clone(),
            cors_origin: config.server.cors_origin.clone(),
            config_summary: config.redacted_summary(),
        }
    }
}
