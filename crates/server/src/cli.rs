//! CLI argument parsing and subcommand implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use korsync_core::Config;
use korsync_refresh::scheduler::{parse_cron, run_scheduler};
use korsync_refresh::{JobStatus, RunOutcome, TriggerKind};

use crate::startup::{build_service, startup_refresh};
use crate::state::AppState;

/// Korona mirror refresh orchestrator.
#[derive(Parser, Debug)]
#[command(name = "korsync", version, about)]
pub struct Cli {
    /// Config profile; keys are read as `{PROFILE}_{KEY}` first.
    #[arg(long, global = true, env = "KORSYNC_PROFILE")]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API (start/status/cancel) with auto-refresh.
    Serve {
        /// Bind address (overrides HOST).
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides PORT).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the full pipeline once and exit. Meant for an external cron.
    RunOnce {
        /// Monthly sales lookback in days (overrides MONTHLY_DAYS).
        #[arg(long)]
        days: Option<u32>,
    },
    /// Stay resident and run the pipeline on a cron schedule.
    Worker {
        /// Cron expression, 5 or 6 fields (overrides REFRESH_SCHEDULE).
        #[arg(long)]
        schedule: Option<String>,
        #[arg(long)]
        days: Option<u32>,
    },
    /// Print a crontab line that runs `run-once` on a schedule.
    Crontab {
        /// 5-field cron expression (overrides REFRESH_SCHEDULE).
        #[arg(long)]
        schedule: Option<String>,
        #[arg(long)]
        days: Option<u32>,
        /// Append output to this file instead of discarding it.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Path of the korsync binary (defaults to the running executable).
        #[arg(long)]
        binary: Option<PathBuf>,
    },
}

/// Exit code for a one-shot run: 0 completed or skipped, 1 failed, 2 cancelled.
pub fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::AlreadyActive(_) => 0,
        RunOutcome::Finished(result) => match result.status {
            JobStatus::Completed => 0,
            JobStatus::Cancelled => 2,
            _ => 1,
        },
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

pub async fn serve(mut config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.log_summary();

    let service = build_service(&config).await?;
    startup_refresh(&service, config.refresh.startup_refresh).await;

    let state = Arc::new(AppState::new(service, &config));
    let app = crate::build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub async fn run_once(config: Config, days: Option<u32>) -> anyhow::Result<i32> {
    let service = build_service(&config).await?;
    let outcome = service.run_now(TriggerKind::Cli, days).await?;
    match &outcome {
        RunOutcome::AlreadyActive(id) => {
            info!(active_job = %id, "another refresh is running, nothing to do");
        }
        RunOutcome::Finished(result) => {
            info!(
                job_id = %result.job_id,
                status = ?result.status,
                failed_phase = ?result.failed_phase,
                error = ?result.error,
                "one-shot refresh finished"
            );
        }
    }
    Ok(exit_code(&outcome))
}

pub async fn worker(config: Config, schedule: Option<String>, days: Option<u32>) -> anyhow::Result<()> {
    let expr = schedule.unwrap_or_else(|| config.worker.schedule.clone());
    let cron = parse_cron(&expr).with_context(|| format!("invalid schedule '{}'", expr))?;
    let service = build_service(&config).await?;

    info!(schedule = %expr, concurrency = config.worker.concurrency, "refresh worker starting");
    run_scheduler(service, cron, days, shutdown_signal()).await;
    info!("refresh worker exited cleanly");
    Ok(())
}

/// Build the crontab entry. Only 5-field expressions are valid crontab syntax.
pub fn crontab_line(
    config: &Config,
    schedule: Option<String>,
    days: Option<u32>,
    log: Option<PathBuf>,
    binary: Option<PathBuf>,
) -> anyhow::Result<String> {
    let expr = schedule.unwrap_or_else(|| config.worker.schedule.clone());
    if expr.split_whitespace().count() != 5 {
        anyhow::bail!("crontab schedules need exactly 5 fields, got '{}'", expr);
    }
    parse_cron(&expr).with_context(|| format!("invalid schedule '{}'", expr))?;

    let binary = match binary {
        Some(b) => b,
        None => std::env::current_exe().context("cannot determine korsync binary path")?,
    };
    let days = days.unwrap_or(config.refresh.monthly_days);

    let mut line = expr.split_whitespace().collect::<Vec<_>>().join(" ");
    if !config.profile.is_empty() {
        line.push_str(&format!(" KORSYNC_PROFILE={}", config.profile));
    }
    line.push_str(&format!(" {} run-once --days {}", binary.display(), days));
    match log {
        Some(path) => line.push_str(&format!(" >> {} 2>&1", path.display())),
        None => line.push_str(" > /dev/null 2>&1"),
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use korsync_refresh::{JobResult, Phase};
    use uuid::Uuid;

    fn finished(status: JobStatus) -> RunOutcome {
        RunOutcome::Finished(JobResult {
            job_id: Uuid::new_v4(),
            status,
            completed_phases: vec![Phase::Stores],
            failed_phase: None,
            error: None,
        })
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&finished(JobStatus::Completed)), 0);
        assert_eq!(exit_code(&finished(JobStatus::Failed)), 1);
        assert_eq!(exit_code(&finished(JobStatus::Cancelled)), 2);
        assert_eq!(exit_code(&RunOutcome::AlreadyActive(Uuid::new_v4())), 0);
    }

    #[test]
    fn test_crontab_line() {
        let mut config = Config::for_profile("CLITEST");
        config.refresh.monthly_days = 30;
        let line = crontab_line(
            &config,
            Some("15 2 * * *".to_string()),
            Some(45),
            Some(PathBuf::from("/var/log/korsync.log")),
            Some(PathBuf::from("/usr/local/bin/korsync")),
        )
        .unwrap();
        assert_eq!(
            line,
            "15 2 * * * KORSYNC_PROFILE=CLITEST /usr/local/bin/korsync run-once --days 45 >> /var/log/korsync.log 2>&1"
        );
    }

    #[test]
    fn test_crontab_defaults_and_validation() {
        let mut config = Config::for_profile("");
        config.refresh.monthly_days = 30;
        config.worker.schedule = "0 3 * * *".to_string();
        let line = crontab_line(&config, None, None, None, Some(PathBuf::from("korsync"))).unwrap();
        assert_eq!(line, "0 3 * * * korsync run-once --days 30 > /dev/null 2>&1");

        assert!(crontab_line(&config, Some("0 0 3 * * *".into()), None, None, None).is_err());
        assert!(crontab_line(&config, Some("61 3 * * *".into()), None, None, None).is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["korsync", "run-once", "--days", "7"]).unwrap();
        assert!(matches!(cli.command, Command::RunOnce { days: Some(7) }));

        let cli = Cli::try_parse_from(["korsync", "worker", "--schedule", "0 4 * * *"]).unwrap();
        match cli.command {
            Command::Worker { schedule, days } => {
                assert_eq!(schedule.as_deref(), Some("0 4 * * *"));
                assert_eq!(days, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
