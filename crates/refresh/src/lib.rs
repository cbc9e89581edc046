//! Refresh orchestration for the Korona mirror.
//!
//! Four synchronization phases (stores, products, stocks, monthly sales) run
//! in fixed order as one [`RefreshJob`]. At most one job is active at a time;
//! the [`JobStore`] holds that single-flight slot together with every job's
//! status record, so triggers from separate processes (cron one-shots, the
//! resident worker, web handlers) all observe the same state.

pub mod error;
pub mod history;
pub mod job;
pub mod phase;
pub mod pipeline;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod sync;

pub use error::{RefreshError, StoreError, SyncError};
pub use history::JobHistory;
pub use job::{JobResult, JobStatus, RefreshJob, TriggerKind};
pub use phase::Phase;
pub use pipeline::RefreshPipeline;
pub use service::{RefreshOverview, RefreshService, RefreshSettings, RunOutcome, StartOutcome};
pub use store::{BeginOutcome, CancelOutcome, JobStore, MemoryJobStore};
pub use sync::{CommandSync, SyncOperation, SyncReport};
