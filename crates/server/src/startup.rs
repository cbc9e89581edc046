//! Process startup: job store selection, service wiring, startup refresh.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use korsync_core::Config;
use korsync_refresh::{
    CommandSync, JobHistory, JobStore, MemoryJobStore, RefreshService, RefreshSettings, TriggerKind,
};

/// Pick the job store. Redis when compiled in and `REDIS_URL` is set, so that
/// every process shares one single-flight slot; otherwise in-process memory.
pub async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn JobStore>> {
    if let Some(store) = shared_store(config).await? {
        return Ok(store);
    }
    info!("using in-memory refresh job store");
    Ok(Arc::new(MemoryJobStore::new()))
}

#[cfg(feature = "redis-store")]
async fn shared_store(config: &Config) -> anyhow::Result<Option<Arc<dyn JobStore>>> {
    use korsync_refresh::store::{RedisJobStore, RedisStoreOptions};

    let Some(url) = &config.redis.url else {
        return Ok(None);
    };
    let options = RedisStoreOptions {
        lock_ttl_secs: config.refresh.lock_ttl_secs,
        job_ttl_secs: config.refresh.job_ttl_secs,
    };
    Ok(Some(Arc::new(RedisJobStore::connect(url, options).await?)))
}

#[cfg(not(feature = "redis-store"))]
async fn shared_store(config: &Config) -> anyhow::Result<Option<Arc<dyn JobStore>>> {
    if config.redis.is_configured() {
        warn!("REDIS_URL is set but this build lacks the redis-store feature; refresh state is per-process");
    }
    Ok(None)
}

pub async fn build_service(config: &Config) -> anyhow::Result<RefreshService> {
    config.validate()?;
    let store = build_store(config).await?;
    let sync = Arc::new(CommandSync::from_config(config));
    let history = JobHistory::new(&config.storage.data_dir);
    info!(path = %history.path().display(), backend = store.backend(), "refresh service ready");
    Ok(RefreshService::new(
        store,
        sync,
        RefreshSettings::from_config(&config.refresh),
        Some(history),
    ))
}

/// Boot-time staleness check. Skipped when `DISABLE_STARTUP_SYNC` is set.
pub async fn startup_refresh(service: &RefreshService, enabled: bool) {
    if !enabled {
        info!("startup refresh disabled");
        return;
    }
    match service.start_if_due(TriggerKind::Startup, Utc::now()).await {
        Ok(Some(outcome)) if outcome.started => {
            info!(job_id = %outcome.job_id, "startup refresh started");
        }
        Ok(Some(outcome)) => {
            info!(active_job = %outcome.job_id, "refresh already running at startup");
        }
        Ok(None) => info!("data is fresh, no startup refresh"),
        Err(e) => warn!(error = %e, "startup refresh check failed"),
    }
}
