//! In-process job store.
//!
//! Suitable when every trigger lives in one process (the server with its
//! auto-refresh, or tests). Cross-process deployments use the Redis store.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{JobStatus, RefreshJob};

use super::{BeginOutcome, CancelOutcome, JobStore};

/// Finished jobs kept for status queries before the oldest are dropped.
const MAX_RETAINED_JOBS: usize = 100;

#[derive(Debug, Default)]
struct Inner {
    /// Insertion order (oldest first).
    jobs: IndexMap<Uuid, RefreshJob>,
    active: Option<Uuid>,
    last_success: Option<DateTime<Utc>>,
}

impl Inner {
    fn prune(&mut self) {
        while self.jobs.len() > MAX_RETAINED_JOBS {
            let oldest_terminal = self
                .jobs
                .iter()
                .position(|(_, job)| job.is_terminal());
            match oldest_terminal {
                Some(index) => {
                    self.jobs.shift_remove_index(index);
                }
                None => break,
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that starts with a known last successful completion.
    pub fn with_last_success(ts: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                last_success: Some(ts),
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-written record.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn try_begin(&self, job: RefreshJob) -> Result<BeginOutcome, StoreError> {
        let mut inner = self.lock();
        if let Some(active) = inner.active {
            return Ok(BeginOutcome::AlreadyActive(active));
        }
        inner.active = Some(job.id);
        inner.jobs.insert(job.id, job.clone());
        inner.prune();
        Ok(BeginOutcome::Started(job))
    }

    async fn get(&self, id: Uuid) -> Result<Option<RefreshJob>, StoreError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn save(&self, job: &RefreshJob) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&job.id) {
            Some(stored) if stored.is_terminal() => {}
            Some(stored) => {
                let cancel_requested = stored.cancel_requested || job.cancel_requested;
                *stored = job.clone();
                stored.cancel_requested = cancel_requested;
            }
            None => {
                inner.jobs.insert(job.id, job.clone());
            }
        }
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let mut inner = self.lock();
        let outcome = match inner.jobs.get_mut(&id) {
            None => CancelOutcome::Unknown,
            Some(job) => {
                if job.request_cancel() {
                    CancelOutcome::Requested
                } else {
                    CancelOutcome::AlreadyTerminal
                }
            }
        };
        Ok(outcome)
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .jobs
            .get(&id)
            .map(|job| job.cancel_requested)
            .unwrap_or(false))
    }

    async fn finish(&self, job: &RefreshJob) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&job.id) {
            Some(stored) if stored.is_terminal() => {}
            Some(stored) => {
                let cancel_requested = stored.cancel_requested || job.cancel_requested;
                *stored = job.clone();
                stored.cancel_requested = cancel_requested;
            }
            None => {
                inner.jobs.insert(job.id, job.clone());
            }
        }
        if inner.active == Some(job.id) {
            inner.active = None;
        }
        if job.status == JobStatus::Completed {
            inner.last_success = job.finished_at.or(Some(Utc::now()));
        }
        inner.prune();
        Ok(())
    }

    async fn active_job(&self) -> Result<Option<Uuid>, StoreError> {
        Ok(self.lock().active)
    }

    async fn last_successful_completion(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.lock().last_success)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TriggerKind;
    use crate::phase::Phase;

    fn pending() -> RefreshJob {
        RefreshJob::new(TriggerKind::Manual, 30, Utc::now())
    }

    #[tokio::test]
    async fn test_second_begin_reports_active_job() {
        let store = MemoryJobStore::new();
        let first = pending();
        let first_id = first.id;
        assert!(matches!(store.try_begin(first).await.unwrap(), BeginOutcome::Started(_)));

        let second = pending();
        let second_id = second.id;
        assert_eq!(
            store.try_begin(second).await.unwrap(),
            BeginOutcome::AlreadyActive(first_id)
        );
        assert!(store.get(second_id).await.unwrap().is_none());
        assert_eq!(store.active_job().await.unwrap(), Some(first_id));
    }

    #[tokio::test]
    async fn test_finish_releases_slot_and_records_success() {
        let store = MemoryJobStore::new();
        let BeginOutcome::Started(mut job) = store.try_begin(pending()).await.unwrap() else {
            panic!("expected Started");
        };
        job.mark_running(Utc::now()).unwrap();
        for phase in Phase::ALL {
            job.enter_phase(phase).unwrap();
            job.complete_phase(phase, None).unwrap();
        }
        job.mark_completed(Utc::now()).unwrap();
        store.finish(&job).await.unwrap();

        assert_eq!(store.active_job().await.unwrap(), None);
        assert_eq!(store.last_successful_completion().await.unwrap(), job.finished_at);
        assert!(matches!(store.try_begin(pending()).await.unwrap(), BeginOutcome::Started(_)));
    }

    #[tokio::test]
    async fn test_failed_finish_keeps_previous_success() {
        let earlier = Utc::now() - chrono::Duration::hours(3);
        let store = MemoryJobStore::with_last_success(earlier);
        let BeginOutcome::Started(mut job) = store.try_begin(pending()).await.unwrap() else {
            panic!("expected Started");
        };
        job.mark_running(Utc::now()).unwrap();
        job.enter_phase(Phase::Stores).unwrap();
        job.mark_failed(Phase::Stores, "boom", Utc::now()).unwrap();
        store.finish(&job).await.unwrap();

        assert_eq!(store.last_successful_completion().await.unwrap(), Some(earlier));
        assert_eq!(store.active_job().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_save_does_not_clear_cancel_flag() {
        let store = MemoryJobStore::new();
        let BeginOutcome::Started(mut job) = store.try_begin(pending()).await.unwrap() else {
            panic!("expected Started");
        };
        job.mark_running(Utc::now()).unwrap();

        assert_eq!(store.request_cancel(job.id).await.unwrap(), CancelOutcome::Requested);
        // The runner's copy predates the cancel request.
        job.enter_phase(Phase::Stores).unwrap();
        store.save(&job).await.unwrap();

        assert!(store.is_cancel_requested(job.id).await.unwrap());
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, Some(Phase::Stores));
        assert!(stored.cancel_requested);
    }

    #[tokio::test]
    async fn test_finish_keeps_cancel_flag() {
        let store = MemoryJobStore::new();
        let BeginOutcome::Started(mut job) = store.try_begin(pending()).await.unwrap() else {
            panic!("expected Started");
        };
        job.mark_running(Utc::now()).unwrap();
        for phase in Phase::ALL {
            job.enter_phase(phase).unwrap();
            job.complete_phase(phase, None).unwrap();
        }
        // Cancel lands after the last boundary; the runner's copy never sees it.
        assert_eq!(store.request_cancel(job.id).await.unwrap(), CancelOutcome::Requested);
        job.mark_completed(Utc::now()).unwrap();
        store.finish(&job).await.unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.cancel_requested);
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_terminal() {
        let store = MemoryJobStore::new();
        assert_eq!(
            store.request_cancel(Uuid::new_v4()).await.unwrap(),
            CancelOutcome::Unknown
        );

        let BeginOutcome::Started(mut job) = store.try_begin(pending()).await.unwrap() else {
            panic!("expected Started");
        };
        job.mark_running(Utc::now()).unwrap();
        job.mark_cancelled(Utc::now()).unwrap();
        store.finish(&job).await.unwrap();

        assert_eq!(
            store.request_cancel(job.id).await.unwrap(),
            CancelOutcome::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn test_terminal_record_is_not_overwritten() {
        let store = MemoryJobStore::new();
        let BeginOutcome::Started(mut job) = store.try_begin(pending()).await.unwrap() else {
            panic!("expected Started");
        };
        job.mark_running(Utc::now()).unwrap();
        let stale = job.clone();
        job.mark_cancelled(Utc::now()).unwrap();
        store.finish(&job).await.unwrap();

        store.save(&stale).await.unwrap();
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_prune_keeps_active_job() {
        let store = MemoryJobStore::new();
        for _ in 0..(MAX_RETAINED_JOBS + 10) {
            let BeginOutcome::Started(mut job) = store.try_begin(pending()).await.unwrap() else {
                panic!("expected Started");
            };
            job.mark_running(Utc::now()).unwrap();
            job.mark_cancelled(Utc::now()).unwrap();
            store.finish(&job).await.unwrap();
        }
        let BeginOutcome::Started(active) = store.try_begin(pending()).await.unwrap() else {
            panic!("expected Started");
        };
        assert!(store.get(active.id).await.unwrap().is_some());
        assert!(store.lock().jobs.len() <= MAX_RETAINED_JOBS);
    }
}
