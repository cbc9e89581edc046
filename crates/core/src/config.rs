use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Boolean flag: "1", "true", "yes", "on" (case-insensitive) are true.
fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub korona: KoronaConfig,
    pub refresh: RefreshConfig,
    pub sync: SyncCommandConfig,
    pub worker: WorkerConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `KORSYNC_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("KORSYNC_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            storage: StorageConfig::from_env_profiled(p),
            database: DatabaseConfig::from_env_profiled(p),
            redis: RedisConfig::from_env_profiled(p),
            korona: KoronaConfig::from_env_profiled(p),
            refresh: RefreshConfig::from_env_profiled(p),
            sync: SyncCommandConfig::from_env_profiled(p),
            worker: WorkerConfig::from_env_profiled(p),
            auth: AuthConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject values the refresh pipeline cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.refresh.monthly_days == 0 {
            return Err(CoreError::config("MONTHLY_DAYS", "must be at least 1"));
        }
        if self.refresh.interval_minutes == 0 {
            return Err(CoreError::config("REFRESH_INTERVAL_MINUTES", "must be at least 1"));
        }
        if self.refresh.interval_minutes > MAX_INTERVAL_MINUTES {
            return Err(CoreError::config(
                "REFRESH_INTERVAL_MINUTES",
                format!("must be at most {}", MAX_INTERVAL_MINUTES),
            ));
        }
        if self.refresh.lock_ttl_secs == 0 {
            return Err(CoreError::config("REFRESH_LOCK_TTL_SECS", "must be at least 1"));
        }
        if self.worker.concurrency == 0 {
            return Err(CoreError::config("WORKER_CONCURRENCY", "must be at least 1"));
        }
        if self.sync.command.is_empty() {
            return Err(CoreError::config("SYNC_COMMAND", "must name a program"));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:   {}:{}", self.server.host, self.server.port);
        tracing::info!("  storage:  data_dir={}", self.storage.data_dir.display());
        tracing::info!("  database: configured={}", self.database.is_configured());
        tracing::info!("  redis:    configured={}", self.redis.is_configured());
        tracing::info!(
            "  korona:   base_url={}, account={}",
            self.korona.base_url.as_deref().unwrap_or("(none)"),
            self.korona.account_id.as_deref().unwrap_or("(none)")
        );
        tracing::info!(
            "  refresh:  monthly_days={}, interval={}m, auto={}, startup={}",
            self.refresh.monthly_days,
            self.refresh.interval_minutes,
            self.refresh.auto_refresh,
            self.refresh.startup_refresh
        );
        tracing::info!("  sync:     command={:?}", self.sync.command);
        tracing::info!(
            "  worker:   concurrency={}, schedule={}",
            self.worker.concurrency,
            self.worker.schedule
        );
        tracing::info!("  auth:     token_required={}", self.auth.api_token.is_some());
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "server": { "host": self.server.host, "port": self.server.port },
            "storage": { "data_dir": self.storage.data_dir },
            "database": { "configured": self.database.is_configured() },
            "redis": { "configured": self.redis.is_configured() },
            "korona": {
                "base_url": self.korona.base_url,
                "account_id": self.korona.account_id,
                "configured": self.korona.is_configured(),
            },
            "refresh": {
                "monthly_days": self.refresh.monthly_days,
                "interval_minutes": self.refresh.interval_minutes,
                "phase_timeout_secs": self.refresh.phase_timeout_secs,
                "auto_refresh": self.refresh.auto_refresh,
            },
            "worker": {
                "concurrency": self.worker.concurrency,
                "schedule": self.worker.schedule,
            },
            "auth": { "token_required": self.auth.api_token.is_some() },
        })
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_u16(p, "PORT", 8000),
            cors_origin: profiled_env_or(p, "CORS_ORIGIN", "*"),
        }
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            data_dir: PathBuf::from(profiled_env_or(p, "DATA_DIR", "data")),
        }
    }
}

// ── Primary datastore ─────────────────────────────────────────

/// Connection string of the primary datastore. Only forwarded to the sync
/// entry points; the orchestrator itself never opens it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

impl DatabaseConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "DATABASE_URL"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

// ── Redis (shared cache / broker) ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: Option<String>,
}

impl RedisConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "REDIS_URL"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

// ── Korona POS API ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KoronaConfig {
    pub base_url: Option<String>,
    pub account_id: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl KoronaConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            base_url: profiled_env_opt(p, "KORONA_BASE_URL"),
            account_id: profiled_env_opt(p, "KORONA_ACCOUNT_ID"),
            user: profiled_env_opt(p, "KORONA_USER"),
            password: profiled_env_opt(p, "KORONA_PASSWORD"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
            && self.account_id.is_some()
            && self.user.is_some()
            && self.password.is_some()
    }
}

// ── Refresh pipeline ──────────────────────────────────────────

/// Upper bound for `REFRESH_INTERVAL_MINUTES` (ten years).
pub const MAX_INTERVAL_MINUTES: u64 = 10 * 365 * 24 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Lookback window for the monthly sales phase.
    pub monthly_days: u32,
    /// Staleness threshold for the auto-refresh trigger.
    pub interval_minutes: u64,
    /// TTL of the shared single-flight lock; refreshed at every phase boundary.
    pub lock_ttl_secs: u64,
    /// How long job records stay queryable in the shared store.
    pub job_ttl_secs: u64,
    /// Optional upper bound for one phase. `None` waits indefinitely.
    pub phase_timeout_secs: Option<u64>,
    pub auto_refresh: bool,
    pub startup_refresh: bool,
}

impl RefreshConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            monthly_days: profiled_env_u32(p, "MONTHLY_DAYS", 30),
            interval_minutes: profiled_env_u64(p, "REFRESH_INTERVAL_MINUTES", 720),
            lock_ttl_secs: profiled_env_u64(p, "REFRESH_LOCK_TTL_SECS", 10_800),
            job_ttl_secs: profiled_env_u64(p, "REFRESH_JOB_TTL_SECS", 3_600),
            phase_timeout_secs: profiled_env_opt(p, "REFRESH_PHASE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|secs: &u64| *secs > 0),
            auto_refresh: profiled_env_bool(p, "AUTO_REFRESH", true),
            startup_refresh: !profiled_env_bool(p, "DISABLE_STARTUP_SYNC", false),
        }
    }
}

// ── Sync entry points ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCommandConfig {
    /// Program plus leading arguments, e.g. `["python", "manage.py"]`.
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub products_skip_csv: bool,
}

impl SyncCommandConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            command: profiled_env_or(p, "SYNC_COMMAND", "python manage.py")
                .split_whitespace()
                .map(String::from)
                .collect(),
            working_dir: profiled_env_opt(p, "SYNC_WORKDIR").map(PathBuf::from),
            products_skip_csv: profiled_env_bool(p, "SYNC_PRODUCTS_SKIP_CSV", true),
        }
    }
}

// ── Resident worker ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Runtime worker threads for the resident worker process.
    pub concurrency: usize,
    /// Cron expression (5 or 6 fields) for the nightly run.
    pub schedule: String,
}

impl WorkerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            concurrency: profiled_env_u32(p, "WORKER_CONCURRENCY", 2) as usize,
            schedule: profiled_env_or(p, "REFRESH_SCHEDULE", "0 3 * * *"),
        }
    }
}

// ── Auth ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared token for the refresh API. `None` leaves the API open.
    pub api_token: Option<String>,
}

impl AuthConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            api_token: profiled_env_opt(p, "REFRESH_API_TOKEN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own profile prefix so parallel tests never share keys.

    #[test]
    fn test_defaults_without_env() {
        let config = Config::for_profile("CFGDEFAULTS");
        assert_eq!(config.refresh.monthly_days, 30);
        assert_eq!(config.refresh.interval_minutes, 720);
        assert!(config.refresh.auto_refresh);
        assert!(config.sync.products_skip_csv);
        assert_eq!(config.worker.schedule, "0 3 * * *");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_profiled_key_wins() {
        env::set_var("CFGPROF_MONTHLY_DAYS", "14");
        env::set_var("CFGPROF_REFRESH_INTERVAL_MINUTES", "60");
        env::set_var("CFGPROF_SYNC_COMMAND", "/opt/app/bin/manage --settings prod");
        let config = Config::for_profile("cfgprof");
        assert_eq!(config.profile, "CFGPROF");
        assert_eq!(config.refresh.monthly_days, 14);
        assert_eq!(config.refresh.interval_minutes, 60);
        assert_eq!(
            config.sync.command,
            vec!["/opt/app/bin/manage", "--settings", "prod"]
        );
    }

    #[test]
    fn test_bool_flags() {
        env::set_var("CFGBOOL_DISABLE_STARTUP_SYNC", "1");
        env::set_var("CFGBOOL_AUTO_REFRESH", "false");
        let config = Config::for_profile("CFGBOOL");
        assert!(!config.refresh.startup_refresh);
        assert!(!config.refresh.auto_refresh);
    }

    #[test]
    fn test_zero_phase_timeout_means_unbounded() {
        env::set_var("CFGTIMEOUT_REFRESH_PHASE_TIMEOUT_SECS", "0");
        let config = Config::for_profile("CFGTIMEOUT");
        assert_eq!(config.refresh.phase_timeout_secs, None);
    }

    #[test]
    fn test_validate_rejects_zero_days() {
        let mut config = Config::for_profile("CFGVALIDATE");
        config.refresh.monthly_days = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MONTHLY_DAYS"));

        let mut config = Config::for_profile("CFGVALIDATE");
        config.sync.command.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_interval() {
        let mut config = Config::for_profile("CFGINTERVAL");
        config.refresh.interval_minutes = MAX_INTERVAL_MINUTES;
        assert!(config.validate().is_ok());

        config.refresh.interval_minutes = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("REFRESH_INTERVAL_MINUTES"));
    }

    #[test]
    fn test_redacted_summary_hides_secrets() {
        env::set_var("CFGREDACT_KORONA_PASSWORD", "hunter2");
        env::set_var("CFGREDACT_REFRESH_API_TOKEN", "s3cret-token");
        let config = Config::for_profile("CFGREDACT");
        let json = config.redacted_summary().to_string();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("s3cret-token"));
        assert!(json.contains("\"token_required\":true"));
    }
}
