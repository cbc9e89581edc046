//! The phase sequencer.
//!
//! [`RefreshPipeline::run`] drives one job through stores → products →
//! stocks → monthly sales. Cancellation is checked before each phase only,
//! so an in-flight phase always finishes or fails on its own first. A failed
//! phase stops the run; nothing is retried and finished phases are not
//! rolled back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{RefreshError, SyncError};
use crate::history::JobHistory;
use crate::job::{JobResult, RefreshJob};
use crate::phase::Phase;
use crate::store::JobStore;
use crate::sync::SyncOperation;

#[derive(Clone)]
pub struct RefreshPipeline {
    store: Arc<dyn JobStore>,
    sync: Arc<dyn SyncOperation>,
    history: Option<JobHistory>,
    phase_timeout: Option<Duration>,
}

impl RefreshPipeline {
    pub fn new(store: Arc<dyn JobStore>, sync: Arc<dyn SyncOperation>) -> Self {
        Self {
            store,
            sync,
            history: None,
            phase_timeout: None,
        }
    }

    pub fn with_history(mut self, history: JobHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.phase_timeout = timeout;
        self
    }

    /// Run a job that already owns the single-flight slot.
    ///
    /// If the stored record cannot be loaded the slot is released and a
    /// failed record is left behind, so later triggers are not blocked.
    pub async fn run(&self, claimed: &RefreshJob) -> Result<JobResult, RefreshError> {
        let job_id = claimed.id;
        let mut job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return Err(self.abandon(claimed, RefreshError::NotFound(job_id)).await),
            Err(e) => return Err(self.abandon(claimed, e.into()).await),
        };
        job.days_window = claimed.days_window;

        if let Err(e) = job.mark_running(Utc::now()) {
            // Not pending: some other runner owns it. Leave the slot alone.
            warn!(job_id = %job_id, error = %e, "refusing to run job");
            return Err(e);
        }
        self.persist(&job).await;
        info!(job_id = %job_id, trigger = ?job.trigger, days_window = job.days_window, "refresh started");

        let outcome = self.run_phases(&mut job).await;
        if let Err(e) = outcome {
            // A transition bug must not leave the slot held forever.
            error!(job_id = %job_id, error = %e, "refresh aborted on invalid transition");
            let phase = job.phase.unwrap_or(Phase::Stores);
            if !job.is_terminal() {
                let _ = job.mark_failed(phase, e.to_string(), Utc::now());
            }
        }

        // A cancel that landed during the last phase is only visible in the store.
        if !job.cancel_requested && self.cancel_requested(job_id).await {
            job.cancel_requested = true;
        }
        self.record(&job).await;

        info!(
            job_id = %job_id,
            status = ?job.status,
            failed_phase = ?job.failed_phase,
            "refresh finished"
        );
        Ok(JobResult::from(&job))
    }

    async fn abandon(&self, claimed: &RefreshJob, cause: RefreshError) -> RefreshError {
        error!(job_id = %claimed.id, error = %cause, "claimed refresh job could not be loaded");
        let mut job = claimed.clone();
        job.abort(cause.to_string(), Utc::now());
        self.record(&job).await;
        cause
    }

    /// Store the terminal record (releasing the slot) and append history.
    async fn record(&self, job: &RefreshJob) {
        if let Err(e) = self.store.finish(job).await {
            error!(job_id = %job.id, error = %e, "failed to record refresh outcome");
        }
        if let Some(history) = &self.history {
            history.append(job);
        }
    }

    async fn run_phases(&self, job: &mut RefreshJob) -> Result<(), RefreshError> {
        for phase in Phase::ALL {
            if self.cancel_requested(job.id).await {
                job.mark_cancelled(Utc::now())?;
                info!(job_id = %job.id, before = %phase, "refresh cancelled between phases");
                return Ok(());
            }

            job.enter_phase(phase)?;
            self.persist(job).await;
            info!(job_id = %job.id, phase = %phase, "phase started");

            match self.run_phase(phase, job.days_window).await {
                Ok(report) => {
                    job.complete_phase(phase, report.detail.as_deref())?;
                    self.persist(job).await;
                    info!(
                        job_id = %job.id,
                        phase = %phase,
                        duration_ms = report.duration_ms,
                        "phase completed"
                    );
                }
                Err(e) => {
                    error!(job_id = %job.id, phase = %phase, error = %e, "phase failed");
                    job.mark_failed(phase, e.to_string(), Utc::now())?;
                    return Ok(());
                }
            }
        }
        job.mark_completed(Utc::now())
    }

    async fn run_phase(
        &self,
        phase: Phase,
        days_window: u32,
    ) -> Result<crate::sync::SyncReport, SyncError> {
        match self.phase_timeout {
            Some(limit) => tokio::time::timeout(limit, self.sync.run(phase, days_window))
                .await
                .unwrap_or(Err(SyncError::TimedOut {
                    phase,
                    secs: limit.as_secs(),
                })),
            None => self.sync.run(phase, days_window).await,
        }
    }

    /// Store read failures count as "not requested"; the next boundary retries.
    async fn cancel_requested(&self, job_id: Uuid) -> bool {
        match self.store.is_cancel_requested(job_id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "cancel check failed");
                false
            }
        }
    }

    /// Progress writes are best effort; the run continues without them.
    async fn persist(&self, job: &RefreshJob) {
        if let Err(e) = self.store.save(job).await {
            warn!(job_id = %job.id, error = %e, "failed to persist refresh progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use chrono::DateTime;

    use crate::error::StoreError;
    use crate::job::{JobStatus, TriggerKind};
    use crate::store::{BeginOutcome, CancelOutcome, MemoryJobStore};
    use crate::sync::SyncReport;

    /// Records phase calls; fails on `fail_on`, sleeps on `slow_on`.
    #[derive(Default)]
    struct RecordingSync {
        calls: Mutex<Vec<(Phase, u32)>>,
        fail_on: Option<Phase>,
        slow_on: Option<Phase>,
    }

    impl RecordingSync {
        fn phases(&self) -> Vec<Phase> {
            self.calls.lock().unwrap().iter().map(|(p, _)| *p).collect()
        }
    }

    #[async_trait]
    impl SyncOperation for RecordingSync {
        async fn run(&self, phase: Phase, days_window: u32) -> Result<SyncReport, SyncError> {
            self.calls.lock().unwrap().push((phase, days_window));
            if self.slow_on == Some(phase) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.fail_on == Some(phase) {
                return Err(SyncError::Other(format!("{} endpoint returned 503", phase)));
            }
            Ok(SyncReport {
                phase,
                duration_ms: 1,
                detail: None,
            })
        }
    }

    /// Memory store whose first `get` fails with a backend error.
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemoryJobStore,
        failed_once: Mutex<bool>,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn try_begin(&self, job: RefreshJob) -> Result<BeginOutcome, StoreError> {
            self.inner.try_begin(job).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<RefreshJob>, StoreError> {
            let first = !std::mem::replace(&mut *self.failed_once.lock().unwrap(), true);
            if first {
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            self.inner.get(id).await
        }

        async fn save(&self, job: &RefreshJob) -> Result<(), StoreError> {
            self.inner.save(job).await
        }

        async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
            self.inner.request_cancel(id).await
        }

        async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.is_cancel_requested(id).await
        }

        async fn finish(&self, job: &RefreshJob) -> Result<(), StoreError> {
            self.inner.finish(job).await
        }

        async fn active_job(&self) -> Result<Option<Uuid>, StoreError> {
            self.inner.active_job().await
        }

        async fn last_successful_completion(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.inner.last_successful_completion().await
        }

        fn backend(&self) -> &'static str {
            "flaky"
        }
    }

    async fn begin(store: &MemoryJobStore, days: u32) -> RefreshJob {
        match store
            .try_begin(RefreshJob::new(TriggerKind::Cli, days, Utc::now()))
            .await
            .unwrap()
        {
            BeginOutcome::Started(job) => job,
            other => panic!("expected Started, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_phases_in_order() {
        let store = Arc::new(MemoryJobStore::new());
        let sync = Arc::new(RecordingSync::default());
        let pipeline = RefreshPipeline::new(store.clone(), sync.clone());
        let job = begin(&store, 21).await;

        let result = pipeline.run(&job).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(sync.phases(), Phase::ALL.to_vec());
        assert!(sync.calls.lock().unwrap().iter().all(|(_, days)| *days == 21));
        assert!(store.last_successful_completion().await.unwrap().is_some());
        assert_eq!(store.active_job().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stocks_failure_stops_before_monthly_sales() {
        let store = Arc::new(MemoryJobStore::new());
        let sync = Arc::new(RecordingSync {
            fail_on: Some(Phase::Stocks),
            ..Default::default()
        });
        let pipeline = RefreshPipeline::new(store.clone(), sync.clone());
        let job = begin(&store, 30).await;
        let id = job.id;

        let result = pipeline.run(&job).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.failed_phase, Some(Phase::Stocks));
        assert!(result.error.unwrap().contains("503"));
        assert_eq!(sync.phases(), vec![Phase::Stores, Phase::Products, Phase::Stocks]);

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.phase, Some(Phase::Stocks));
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(store.last_successful_completion().await.unwrap().is_none());
        assert_eq!(store.active_job().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_before_first_phase() {
        let store = Arc::new(MemoryJobStore::new());
        let sync = Arc::new(RecordingSync::default());
        let pipeline = RefreshPipeline::new(store.clone(), sync.clone());
        let job = begin(&store, 30).await;
        store.request_cancel(job.id).await.unwrap();

        let result = pipeline.run(&job).await.unwrap();
        assert_eq!(result.status, JobStatus::Cancelled);
        assert!(sync.phases().is_empty());
        assert!(result.completed_phases.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_timeout_fails_job() {
        let store = Arc::new(MemoryJobStore::new());
        let sync = Arc::new(RecordingSync {
            slow_on: Some(Phase::Products),
            ..Default::default()
        });
        let pipeline = RefreshPipeline::new(store.clone(), sync.clone())
            .with_phase_timeout(Some(Duration::from_secs(5)));
        let job = begin(&store, 30).await;

        let result = pipeline.run(&job).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.failed_phase, Some(Phase::Products));
        assert!(result.error.unwrap().contains("timed out after 5s"));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = RefreshPipeline::new(store, Arc::new(RecordingSync::default()));
        let never_stored = RefreshJob::new(TriggerKind::Cli, 30, Utc::now());
        let err = pipeline.run(&never_stored).await.unwrap_err();
        assert!(matches!(err, RefreshError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_finished_job_is_not_rerun() {
        let store = Arc::new(MemoryJobStore::new());
        let sync = Arc::new(RecordingSync::default());
        let pipeline = RefreshPipeline::new(store.clone(), sync.clone());
        let job = begin(&store, 30).await;
        pipeline.run(&job).await.unwrap();

        assert!(pipeline.run(&job).await.is_err());
        assert_eq!(sync.phases().len(), 4);
    }

    #[tokio::test]
    async fn test_history_records_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = RefreshPipeline::new(store.clone(), Arc::new(RecordingSync::default()))
            .with_history(JobHistory::new(dir.path()));
        let job = begin(&store, 30).await;
        pipeline.run(&job).await.unwrap();

        let entries = JobHistory::new(dir.path()).recent(5);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job.id, job.id);
        assert_eq!(entries[0].job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_unloadable_job_releases_slot() {
        let store = Arc::new(FlakyStore::default());
        let sync = Arc::new(RecordingSync::default());
        let pipeline = RefreshPipeline::new(store.clone(), sync.clone());
        let job = begin(&store.inner, 30).await;

        let err = pipeline.run(&job).await.unwrap_err();
        assert!(matches!(err, RefreshError::Store(_)));
        assert!(sync.phases().is_empty());
        assert_eq!(store.active_job().await.unwrap(), None);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.unwrap().contains("connection reset"));

        let next = RefreshJob::new(TriggerKind::Manual, 30, Utc::now());
        assert!(matches!(store.try_begin(next).await.unwrap(), BeginOutcome::Started(_)));
    }
}
