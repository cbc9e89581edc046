//! Refresh job record and its state machine.
//!
//! A job is created pending when a trigger fires, advanced only by the
//! pipeline runner, and frozen once it reaches a terminal status. Every
//! transition checks its precondition and returns
//! [`RefreshError::InvalidTransition`] instead of mutating when it does not hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RefreshError;
use crate::phase::Phase;

/// Lifecycle status of a refresh job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// What started a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// `POST /api/refresh/start/`.
    Manual,
    /// Resident worker cron schedule.
    Scheduled,
    /// Staleness check on an authenticated request.
    Auto,
    /// Staleness check at server boot.
    Startup,
    /// One-shot process started by an external cron.
    Cli,
}

/// One execution attempt of the full pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshJob {
    pub id: Uuid,
    pub trigger: TriggerKind,
    /// Lookback window handed to the monthly sales phase.
    pub days_window: u32,
    pub phase: Option<Phase>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub completed_phases: Vec<Phase>,
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
    pub progress: u8,
    pub message: String,
}

impl RefreshJob {
    pub fn new(trigger: TriggerKind, days_window: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            days_window,
            phase: None,
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            completed_phases: Vec::new(),
            failed_phase: None,
            error: None,
            progress: 0,
            message: "Queued...".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Phase the run must enter next, `None` when all four are done.
    pub fn expected_next_phase(&self) -> Option<Phase> {
        match self.completed_phases.last() {
            None => Some(Phase::Stores),
            Some(last) => last.next(),
        }
    }

    fn invalid(&self, detail: impl Into<String>) -> RefreshError {
        RefreshError::InvalidTransition {
            job_id: self.id,
            status: self.status,
            detail: detail.into(),
        }
    }

    fn ensure_running(&self, action: &str) -> Result<(), RefreshError> {
        if self.status == JobStatus::Running {
            Ok(())
        } else {
            Err(self.invalid(format!("{} requires a running job", action)))
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), RefreshError> {
        if self.status != JobStatus::Pending {
            return Err(self.invalid("only a pending job can start"));
        }
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.message = "Starting refresh...".to_string();
        Ok(())
    }

    pub fn enter_phase(&mut self, phase: Phase) -> Result<(), RefreshError> {
        self.ensure_running("entering a phase")?;
        if let Some(current) = self.phase {
            if !self.completed_phases.contains(&current) {
                return Err(self.invalid(format!(
                    "cannot enter {} while {} is in flight",
                    phase, current
                )));
            }
        }
        if self.expected_next_phase() != Some(phase) {
            return Err(self.invalid(format!("{} is out of order", phase)));
        }
        self.phase = Some(phase);
        self.progress = phase.progress_at_start();
        self.message = format!("Syncing {}...", phase.as_str().replace('_', " "));
        Ok(())
    }

    pub fn complete_phase(&mut self, phase: Phase, detail: Option<&str>) -> Result<(), RefreshError> {
        self.ensure_running("completing a phase")?;
        if self.phase != Some(phase) || self.completed_phases.contains(&phase) {
            return Err(self.invalid(format!("{} is not the phase in flight", phase)));
        }
        self.completed_phases.push(phase);
        self.progress = phase.progress_at_end();
        self.message = match detail {
            Some(d) if !d.is_empty() => format!("{} synced: {}", phase, d),
            _ => format!("{} synced", phase),
        };
        Ok(())
    }

    /// Set the cancellation flag. Returns `false` when the job is already
    /// terminal (the request is then a no-op). The flag is never cleared.
    pub fn request_cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), RefreshError> {
        if self.is_terminal() {
            return Err(self.invalid("job already finished"));
        }
        self.status = JobStatus::Cancelled;
        self.cancel_requested = true;
        self.finished_at = Some(now);
        self.message = "Refresh cancelled.".to_string();
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        phase: Phase,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RefreshError> {
        self.ensure_running("failing")?;
        let error = error.into();
        self.status = JobStatus::Failed;
        self.phase = Some(phase);
        self.failed_phase = Some(phase);
        self.message = format!("Failed: {}", error);
        self.error = Some(error);
        self.finished_at = Some(now);
        Ok(())
    }

    /// Fail a claimed job that never got to run a phase, e.g. because its
    /// record could not be loaded. No-op once terminal.
    pub fn abort(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        let error = error.into();
        self.status = JobStatus::Failed;
        self.message = format!("Failed: {}", error);
        self.error = Some(error);
        self.finished_at = Some(now);
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), RefreshError> {
        self.ensure_running("completing")?;
        if self.completed_phases.as_slice() != Phase::ALL {
            return Err(self.invalid("not every phase has completed"));
        }
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.finished_at = Some(now);
        self.message = "Refresh complete.".to_string();
        Ok(())
    }
}

/// Terminal summary of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub completed_phases: Vec<Phase>,
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
}

impl From<&RefreshJob> for JobResult {
    fn from(job: &RefreshJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            completed_phases: job.completed_phases.clone(),
            failed_phase: job.failed_phase,
            error: job.error.clone(),
        }
    }
}
