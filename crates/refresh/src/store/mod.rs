//! Shared refresh state behind a single-flight guard.
//!
//! The "at most one active job" rule is enforced by [`JobStore::try_begin`],
//! which checks and claims the active slot in one critical section (a mutex
//! for [`MemoryJobStore`], `SET NX` for the Redis store). Every trigger goes
//! through it, whichever process it runs in.

mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::RefreshJob;

pub use memory::MemoryJobStore;
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisJobStore, RedisStoreOptions};

/// Result of claiming the single-flight slot.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The job was stored and now owns the active slot.
    Started(RefreshJob),
    /// Another job holds the slot; nothing was stored.
    AlreadyActive(Uuid),
}

/// Result of a cancellation request. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Flag set; the pipeline stops at the next phase boundary.
    Requested,
    /// Job already completed, failed or was cancelled.
    AlreadyTerminal,
    /// No such job.
    Unknown,
}

/// Storage seam for refresh jobs.
///
/// Implementations must keep `cancel_requested` sticky: once
/// [`request_cancel`](JobStore::request_cancel) succeeds, no later
/// [`save`](JobStore::save) of a stale copy may clear it. Records that are
/// already terminal in the store are never overwritten.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Claim the active slot for `job` (pending) unless another job holds it.
    async fn try_begin(&self, job: RefreshJob) -> Result<BeginOutcome, StoreError>;

    /// Fetch a job record with its cancellation flag merged in.
    async fn get(&self, id: Uuid) -> Result<Option<RefreshJob>, StoreError>;

    /// Persist progress of a non-terminal job. Also refreshes any lock lease.
    async fn save(&self, job: &RefreshJob) -> Result<(), StoreError>;

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError>;

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Persist the terminal record, release the active slot if this job holds
    /// it, and record the completion time when the job completed.
    async fn finish(&self, job: &RefreshJob) -> Result<(), StoreError>;

    async fn active_job(&self) -> Result<Option<Uuid>, StoreError>;

    async fn last_successful_completion(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Short backend label for health output ("memory", "redis").
    fn backend(&self) -> &'static str;
}
