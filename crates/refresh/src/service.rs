//! Trigger-facing entry points.
//!
//! Every trigger (HTTP start, auto-refresh, startup check, cron one-shot,
//! resident worker) goes through [`RefreshService`], which claims the
//! single-flight slot in the [`JobStore`] before anything runs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use korsync_core::config::{RefreshConfig, MAX_INTERVAL_MINUTES};

use crate::error::RefreshError;
use crate::history::JobHistory;
use crate::job::{JobResult, RefreshJob, TriggerKind};
use crate::pipeline::RefreshPipeline;
use crate::store::{BeginOutcome, CancelOutcome, JobStore};
use crate::sync::SyncOperation;

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Monthly sales lookback when the trigger does not give one.
    pub default_days: u32,
    /// Minimum age of the last successful completion before auto-refresh.
    pub interval: Duration,
    pub auto_refresh: bool,
    pub phase_timeout: Option<std::time::Duration>,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            default_days: 30,
            interval: Duration::minutes(720),
            auto_refresh: true,
            phase_timeout: None,
        }
    }
}

impl RefreshSettings {
    pub fn from_config(config: &RefreshConfig) -> Self {
        Self {
            default_days: config.monthly_days,
            interval: Duration::minutes(config.interval_minutes.min(MAX_INTERVAL_MINUTES) as i64),
            auto_refresh: config.auto_refresh,
            phase_timeout: config.phase_timeout_secs.map(std::time::Duration::from_secs),
        }
    }
}

/// Result of a start request. `started` is false when another job already
/// held the slot and `job_id` names that job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub job_id: Uuid,
    pub started: bool,
}

/// Result of a blocking run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Finished(JobResult),
    AlreadyActive(Uuid),
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOverview {
    pub active_job: Option<RefreshJob>,
    pub last_successful_completion: Option<DateTime<Utc>>,
    pub next_auto_refresh_at: Option<DateTime<Utc>>,
    pub refresh_due: bool,
    pub auto_refresh: bool,
    pub interval_minutes: i64,
    pub backend: &'static str,
}

struct Inner {
    store: Arc<dyn JobStore>,
    pipeline: RefreshPipeline,
    settings: RefreshSettings,
    history: Option<JobHistory>,
}

#[derive(Clone)]
pub struct RefreshService {
    inner: Arc<Inner>,
}

impl RefreshService {
    pub fn new(
        store: Arc<dyn JobStore>,
        sync: Arc<dyn SyncOperation>,
        settings: RefreshSettings,
        history: Option<JobHistory>,
    ) -> Self {
        let mut pipeline =
            RefreshPipeline::new(store.clone(), sync).with_phase_timeout(settings.phase_timeout);
        if let Some(h) = &history {
            pipeline = pipeline.with_history(h.clone());
        }
        Self {
            inner: Arc::new(Inner {
                store,
                pipeline,
                settings,
                history,
            }),
        }
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.inner.settings
    }

    pub fn history(&self) -> Option<&JobHistory> {
        self.inner.history.as_ref()
    }

    pub fn backend(&self) -> &'static str {
        self.inner.store.backend()
    }

    /// Claim the single-flight slot for a new pending job without running it.
    pub async fn begin(&self, trigger: TriggerKind, days: Option<u32>) -> Result<BeginOutcome, RefreshError> {
        let days = days.unwrap_or(self.inner.settings.default_days);
        let job = RefreshJob::new(trigger, days, Utc::now());
        Ok(self.inner.store.try_begin(job).await?)
    }

    /// Run a job returned by [`begin`](Self::begin) on the current task.
    pub async fn run_claimed(&self, job: &RefreshJob) -> Result<JobResult, RefreshError> {
        self.inner.pipeline.run(job).await
    }

    /// Create a job and run it in the background. Returns immediately.
    pub async fn start(&self, trigger: TriggerKind, days: Option<u32>) -> Result<StartOutcome, RefreshError> {
        match self.begin(trigger, days).await? {
            BeginOutcome::Started(job) => {
                let job_id = job.id;
                let days_window = job.days_window;
                info!(job_id = %job_id, trigger = ?trigger, days_window, "refresh job queued");

                let pipeline = self.inner.pipeline.clone();
                tokio::spawn(async move {
                    if let Err(e) = pipeline.run(&job).await {
                        error!(job_id = %job_id, error = %e, "refresh job did not run");
                    }
                });
                Ok(StartOutcome {
                    job_id,
                    started: true,
                })
            }
            BeginOutcome::AlreadyActive(active) => {
                info!(active_job = %active, trigger = ?trigger, "refresh already running, not starting another");
                Ok(StartOutcome {
                    job_id: active,
                    started: false,
                })
            }
        }
    }

    /// Create a job and run it on the current task until it finishes.
    pub async fn run_now(&self, trigger: TriggerKind, days: Option<u32>) -> Result<RunOutcome, RefreshError> {
        match self.begin(trigger, days).await? {
            BeginOutcome::Started(job) => Ok(RunOutcome::Finished(self.run_claimed(&job).await?)),
            BeginOutcome::AlreadyActive(active) => {
                info!(active_job = %active, trigger = ?trigger, "refresh already running, skipping");
                Ok(RunOutcome::AlreadyActive(active))
            }
        }
    }

    pub async fn status(&self, id: Uuid) -> Result<RefreshJob, RefreshError> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(RefreshError::NotFound(id))
    }

    /// Request cancellation. Unknown and finished jobs are left untouched.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, RefreshError> {
        let outcome = self.inner.store.request_cancel(id).await?;
        info!(job_id = %id, outcome = ?outcome, "refresh cancel requested");
        Ok(outcome)
    }

    /// Cancel whichever job holds the slot, if any.
    pub async fn cancel_active(&self) -> Result<(Option<Uuid>, CancelOutcome), RefreshError> {
        match self.inner.store.active_job().await? {
            Some(id) => Ok((Some(id), self.cancel(id).await?)),
            None => Ok((None, CancelOutcome::Unknown)),
        }
    }

    pub async fn active_job(&self) -> Result<Option<RefreshJob>, RefreshError> {
        match self.inner.store.active_job().await? {
            Some(id) => Ok(self.inner.store.get(id).await?),
            None => Ok(None),
        }
    }

    pub async fn last_successful_completion(&self) -> Result<Option<DateTime<Utc>>, RefreshError> {
        Ok(self.inner.store.last_successful_completion().await?)
    }

    /// True when no job is active and the last success is older than the
    /// interval (or there has never been one).
    pub async fn is_refresh_due(&self, now: DateTime<Utc>) -> Result<bool, RefreshError> {
        if self.inner.store.active_job().await?.is_some() {
            return Ok(false);
        }
        let last = self.inner.store.last_successful_completion().await?;
        Ok(is_stale(last, now, self.inner.settings.interval))
    }

    /// Start a job with `trigger` when one is due. Concurrent callers race
    /// on the single-flight slot, so at most one of them starts a job.
    pub async fn start_if_due(
        &self,
        trigger: TriggerKind,
        now: DateTime<Utc>,
    ) -> Result<Option<StartOutcome>, RefreshError> {
        if !self.is_refresh_due(now).await? {
            return Ok(None);
        }
        self.start(trigger, None).await.map(Some)
    }

    /// Staleness check run on authenticated requests. No-op when disabled.
    pub async fn auto_refresh_if_due(&self, now: DateTime<Utc>) -> Result<Option<StartOutcome>, RefreshError> {
        if !self.inner.settings.auto_refresh {
            return Ok(None);
        }
        self.start_if_due(TriggerKind::Auto, now).await
    }

    pub async fn overview(&self, now: DateTime<Utc>) -> Result<RefreshOverview, RefreshError> {
        let active_job = self.active_job().await?;
        let last = self.last_successful_completion().await?;
        let interval = self.inner.settings.interval;
        Ok(RefreshOverview {
            refresh_due: active_job.is_none() && is_stale(last, now, interval),
            active_job,
            last_successful_completion: last,
            next_auto_refresh_at: last.and_then(|ts| ts.checked_add_signed(interval)),
            auto_refresh: self.inner.settings.auto_refresh,
            interval_minutes: interval.num_minutes(),
            backend: self.backend(),
        })
    }
}

fn is_stale(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    match last {
        None => true,
        Some(ts) => now - ts > interval,
    }
}
