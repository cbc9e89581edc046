//! Cron-driven refresh loop for the resident worker.
//!
//! Sleeps until the next fire time, then runs a scheduled job on the current
//! task. A fire that finds another job active is skipped and logged; fires
//! missed while a run was in progress are not replayed.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::{error, info, warn};

use crate::job::TriggerKind;
use crate::service::RefreshService;
use crate::store::BeginOutcome;

/// Parse a cron expression, auto-prepending "0 " for 5-field expressions.
///
/// The `cron` crate requires 6 fields (sec min hr dom mon dow); crontab
/// style schedules have 5.
pub fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() == 5 {
        Schedule::from_str(&format!("0 {}", expr))
    } else {
        Schedule::from_str(expr)
    }
}

pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Run scheduled refreshes until `shutdown` resolves.
///
/// When shutdown arrives mid-run, the running job is asked to cancel and the
/// loop waits for it to stop at the next phase boundary.
pub async fn run_scheduler<F>(
    service: RefreshService,
    schedule: Schedule,
    days: Option<u32>,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    info!(days = ?days, "refresh scheduler started");

    loop {
        let now = Utc::now();
        let Some(next) = next_fire(&schedule, now) else {
            warn!("scheduler: schedule has no upcoming fire time, stopping");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(next_run = %next, "scheduler: waiting for next refresh");

        tokio::select! {
            _ = &mut shutdown => {
                info!("refresh scheduler stopped");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let job = match service.begin(TriggerKind::Scheduled, days).await {
            Ok(BeginOutcome::Started(job)) => job,
            Ok(BeginOutcome::AlreadyActive(active)) => {
                info!(active_job = %active, "scheduler: refresh already running, skipping this fire");
                continue;
            }
            Err(e) => {
                error!(error = %e, "scheduler: failed to create refresh job");
                continue;
            }
        };

        let run = service.run_claimed(&job);
        tokio::pin!(run);
        let result = tokio::select! {
            res = &mut run => res,
            _ = &mut shutdown => {
                info!(job_id = %job.id, "scheduler: shutdown requested, cancelling at next phase boundary");
                if let Err(e) = service.cancel(job.id).await {
                    warn!(job_id = %job.id, error = %e, "scheduler: cancel request failed");
                }
                let res = run.await;
                log_result(&res);
                info!("refresh scheduler stopped");
                return;
            }
        };
        log_result(&result);
    }
}

fn log_result(result: &Result<crate::job::JobResult, crate::error::RefreshError>) {
    match result {
        Ok(r) => info!(
            job_id = %r.job_id,
            status = ?r.status,
            failed_phase = ?r.failed_phase,
            "scheduler: refresh finished"
        ),
        Err(e) => error!(error = %e, "scheduler: refresh did not run"),
    }
}
