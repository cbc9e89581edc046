//! Append-only log of finished refresh jobs (`<data_dir>/refresh/jobs.jsonl`).
//!
//! Writes are best effort: a failed append is logged and never fails the run.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::job::RefreshJob;

/// Read size when scanning the log backwards.
const TAIL_CHUNK: u64 = 16 * 1024;

/// One line of the history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub job: RefreshJob,
    pub duration_ms: Option<u64>,
}

impl HistoryEntry {
    fn from_job(job: &RefreshJob) -> Self {
        let duration_ms = match (job.started_at, job.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().try_into().ok(),
            _ => None,
        };
        Self {
            job: job.clone(),
            duration_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobHistory {
    path: PathBuf,
}

impl JobHistory {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("refresh").join("jobs.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, job: &RefreshJob) {
        if let Some(dir) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(dir) {
                warn!(error = %e, "failed to create refresh history directory");
                return;
            }
        }

        let line = match serde_json::to_string(&HistoryEntry::from_job(job)) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "failed to serialize refresh history entry");
                return;
            }
        };

        // Each line is self-contained, so plain appends are safe.
        let mut file = match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "failed to open refresh history");
                return;
            }
        };
        if let Err(e) = writeln!(file, "{}", line) {
            warn!(error = %e, "failed to write refresh history entry");
        }
    }

    /// Most recent `limit` entries, newest first. Malformed lines are skipped.
    ///
    /// Reads backwards from the end of the file, so the cost depends on
    /// `limit` rather than on how long the log has grown.
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        match self.read_tail(limit) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "failed to read refresh history");
                Vec::new()
            }
        }
    }

    fn read_tail(&self, limit: usize) -> io::Result<Vec<HistoryEntry>> {
        let mut file = File::open(&self.path)?;
        let mut pos = file.metadata()?.len();
        // Bytes before the last complete line seen so far.
        let mut pending: Vec<u8> = Vec::new();
        let mut entries = Vec::new();

        while pos > 0 && entries.len() < limit {
            let step = TAIL_CHUNK.min(pos);
            pos -= step;
            file.seek(SeekFrom::Start(pos))?;
            let mut chunk = vec![0u8; step as usize];
            file.read_exact(&mut chunk)?;
            chunk.extend_from_slice(&pending);
            pending = chunk;

            // Everything before the first newline may be the tail of an
            // earlier line, unless the start of the file has been reached.
            let complete_from = if pos == 0 {
                0
            } else {
                match pending.iter().position(|b| *b == b'\n') {
                    Some(i) => i + 1,
                    None => continue,
                }
            };

            for line in pending[complete_from..].split(|b| *b == b'\n').rev() {
                if entries.len() == limit {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                if let Ok(entry) = serde_json::from_slice::<HistoryEntry>(line) {
                    entries.push(entry);
                }
            }
            pending.truncate(complete_from);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, TriggerKind};
    use crate::phase::Phase;
    use chrono::{Duration, Utc};

    fn failed_job() -> RefreshJob {
        let start = Utc::now();
        let mut job = RefreshJob::new(TriggerKind::Scheduled, 30, start);
        job.mark_running(start).unwrap();
        job.enter_phase(Phase::Stores).unwrap();
        job.mark_failed(Phase::Stores, "timeout", start + Duration::seconds(2))
            .unwrap();
        job
    }

    #[test]
    fn test_recent_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path());
        assert!(history.recent(10).is_empty());
    }

    #[test]
    fn test_append_then_recent_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path());
        let first = failed_job();
        let second = failed_job();
        history.append(&first);
        history.append(&second);

        let entries = history.recent(10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].job.id, second.id);
        assert_eq!(entries[1].job.id, first.id);
        assert_eq!(entries[0].job.status, JobStatus::Failed);
        assert_eq!(entries[0].duration_ms, Some(2_000));

        assert_eq!(history.recent(1).len(), 1);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path());
        history.append(&failed_job());
        let mut file = OpenOptions::new().append(true).open(history.path()).unwrap();
        writeln!(file, "{{not json").unwrap();

        assert_eq!(history.recent(10).len(), 1);
    }

    #[test]
    fn test_recent_spans_read_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let history = JobHistory::new(dir.path());
        let ids: Vec<_> = (0..200)
            .map(|_| {
                let job = failed_job();
                history.append(&job);
                job.id
            })
            .collect();
        assert!(fs::metadata(history.path()).unwrap().len() > 2 * TAIL_CHUNK);

        let newest: Vec<_> = history.recent(100).iter().map(|e| e.job.id).collect();
        let expected: Vec<_> = ids.iter().rev().take(100).copied().collect();
        assert_eq!(newest, expected);

        assert_eq!(history.recent(500).len(), 200);
    }
}
