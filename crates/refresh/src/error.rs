//! Refresh error types.

use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;
use crate::phase::Phase;

/// Failure of one external synchronization entry point.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to launch {phase} sync: {source}")]
    Spawn {
        phase: Phase,
        #[source]
        source: std::io::Error,
    },

    #[error("{phase} sync exited with {code}: {stderr_tail}")]
    CommandFailed {
        phase: Phase,
        code: String,
        stderr_tail: String,
    },

    #[error("{phase} sync timed out after {secs}s")]
    TimedOut { phase: Phase, secs: u64 },

    #[error("{0}")]
    Other(String),
}

/// Shared job store failure (connection, serialization).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("job record serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh job not found: {0}")]
    NotFound(Uuid),

    #[error("invalid transition for job {job_id}: {detail} (status: {status:?})")]
    InvalidTransition {
        job_id: Uuid,
        status: JobStatus,
        detail: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
