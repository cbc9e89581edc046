//! External synchronization operations.
//!
//! Each phase delegates to an entry point that talks to the POS API and
//! writes the local database. The pipeline only sees the [`SyncOperation`]
//! seam; [`CommandSync`] runs the entry points as child processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

use korsync_core::Config;

use crate::error::SyncError;
use crate::phase::Phase;

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL_BYTES: usize = 2_000;

/// Outcome of one successful phase.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub phase: Phase,
    pub duration_ms: u64,
    /// Last non-empty output line, shown on the dashboard.
    pub detail: Option<String>,
}

#[async_trait]
pub trait SyncOperation: Send + Sync {
    /// Run one phase to completion. `days_window` only affects monthly sales.
    async fn run(&self, phase: Phase, days_window: u32) -> Result<SyncReport, SyncError>;
}

/// Runs the sync entry points as child processes.
#[derive(Debug, Clone)]
pub struct CommandSync {
    /// Program plus leading arguments, e.g. `["python", "manage.py"]`.
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    products_skip_csv: bool,
    env: Vec<(String, String)>,
}

impl CommandSync {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: None,
            products_skip_csv: true,
            env: Vec::new(),
        }
    }

    /// Build from config, forwarding datastore, cache and POS credentials to
    /// the child environment.
    pub fn from_config(config: &Config) -> Self {
        let mut env = Vec::new();
        let forwarded = [
            ("DATABASE_URL", &config.database.url),
            ("REDIS_URL", &config.redis.url),
            ("KORONA_BASE_URL", &config.korona.base_url),
            ("KORONA_ACCOUNT_ID", &config.korona.account_id),
            ("KORONA_USER", &config.korona.user),
            ("KORONA_PASSWORD", &config.korona.password),
        ];
        for (key, value) in forwarded {
            if let Some(v) = value {
                env.push((key.to_string(), v.clone()));
            }
        }
        Self {
            command: config.sync.command.clone(),
            working_dir: config.sync.working_dir.clone(),
            products_skip_csv: config.sync.products_skip_csv,
            env,
        }
    }

    /// Arguments appended to the base command for `phase`.
    pub fn phase_args(&self, phase: Phase, days_window: u32) -> Vec<String> {
        let mut args = vec![phase.entry_point().to_string()];
        match phase {
            Phase::Products if self.products_skip_csv => args.push("--skip-csv".to_string()),
            Phase::MonthlySales => {
                args.push("--days".to_string());
                args.push(days_window.to_string());
            }
            _ => {}
        }
        args
    }
}

/// Keep the end of `text`, where tracebacks put the actual error.
fn tail(text: &str, max_bytes: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max_bytes {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max_bytes;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[async_trait]
impl SyncOperation for CommandSync {
    async fn run(&self, phase: Phase, days_window: u32) -> Result<SyncReport, SyncError> {
        let Some((program, base_args)) = self.command.split_first() else {
            return Err(SyncError::Other("sync command is empty".to_string()));
        };
        let args = self.phase_args(phase, days_window);

        let mut cmd = Command::new(program);
        cmd.args(base_args)
            .args(&args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(phase = %phase, program = %program, args = ?args, "launching sync entry point");
        let start = Instant::now();
        let output = cmd
            .output()
            .await
            .map_err(|source| SyncError::Spawn { phase, source })?;
        let duration_ms = start.elapsed().as_millis() as u64;

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "signal".to_string());
            return Err(SyncError::CommandFailed {
                phase,
                code,
                stderr_tail: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_BYTES),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(String::from);

        info!(phase = %phase, duration_ms, "sync entry point finished");
        Ok(SyncReport {
            phase,
            duration_ms,
            detail,
        })
    }
}
