//! Redis-backed job store (requires the `redis-store` feature).
//!
//! Key layout, shared by every process that triggers refreshes:
//!
//! ```text
//! refresh_job:lock            active job id, SET NX EX <lock_ttl>
//! refresh_job:<id>            job record (JSON), EX <job_ttl>
//! refresh_job:<id>:cancel     cancellation flag, never deleted before expiry
//! refresh:last_completed_at   {"ts": "<RFC 3339>"}
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{JobStatus, RefreshJob};

use super::{BeginOutcome, CancelOutcome, JobStore};

const LOCK_KEY: &str = "refresh_job:lock";
const LAST_COMPLETED_KEY: &str = "refresh:last_completed_at";

/// Attempts at claiming the lock when its holder disappears between calls.
const BEGIN_ATTEMPTS: usize = 3;

const RELEASE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXTEND_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

fn job_key(id: Uuid) -> String {
    format!("refresh_job:{}", id)
}

fn cancel_key(id: Uuid) -> String {
    format!("refresh_job:{}:cancel", id)
}

#[derive(Serialize, Deserialize)]
struct LastCompleted {
    ts: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RedisStoreOptions {
    /// Lease of the single-flight lock. Extended at every phase boundary.
    pub lock_ttl_secs: u64,
    /// Retention of finished job records.
    pub job_ttl_secs: u64,
}

impl Default for RedisStoreOptions {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 10_800,
            job_ttl_secs: 3_600,
        }
    }
}

impl RedisStoreOptions {
    /// Records of active jobs must outlive the lock that protects them.
    fn active_record_ttl(&self) -> u64 {
        self.job_ttl_secs.max(self.lock_ttl_secs)
    }
}

pub struct RedisJobStore {
    conn: MultiplexedConnection,
    options: RedisStoreOptions,
    release_script: Script,
    extend_script: Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RedisJobStore {
    pub async fn connect(url: &str, options: RedisStoreOptions) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(
            lock_ttl_secs = options.lock_ttl_secs,
            job_ttl_secs = options.job_ttl_secs,
            "redis job store connected"
        );
        Ok(Self {
            conn,
            options,
            release_script: Script::new(RELEASE_IF_OWNER),
            extend_script: Script::new(EXTEND_IF_OWNER),
        })
    }

    async fn read_record(&self, id: Uuid) -> Result<Option<RefreshJob>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(job_key(id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write_record(&self, job: &RefreshJob, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        let _: () = redis::cmd("SET")
            .arg(job_key(job.id))
            .arg(json)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn try_begin(&self, job: RefreshJob) -> Result<BeginOutcome, StoreError> {
        let mut conn = self.conn.clone();
        for _ in 0..BEGIN_ATTEMPTS {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(LOCK_KEY)
                .arg(job.id.to_string())
                .arg("NX")
                .arg("EX")
                .arg(self.options.lock_ttl_secs)
                .query_async(&mut conn)
                .await?;
            if acquired.is_some() {
                self.write_record(&job, self.options.active_record_ttl()).await?;
                return Ok(BeginOutcome::Started(job));
            }

            let holder: Option<String> = redis::cmd("GET")
                .arg(LOCK_KEY)
                .query_async(&mut conn)
                .await?;
            match holder.as_deref().map(Uuid::parse_str) {
                Some(Ok(active)) => return Ok(BeginOutcome::AlreadyActive(active)),
                Some(Err(_)) => {
                    return Err(StoreError::Backend(format!(
                        "lock key {} holds a non-uuid value",
                        LOCK_KEY
                    )))
                }
                // Released between SET and GET; try again.
                None => continue,
            }
        }
        Err(StoreError::Backend(
            "refresh lock kept changing hands; giving up".to_string(),
        ))
    }

    async fn get(&self, id: Uuid) -> Result<Option<RefreshJob>, StoreError> {
        let Some(mut job) = self.read_record(id).await? else {
            return Ok(None);
        };
        if !job.is_terminal() && self.is_cancel_requested(id).await? {
            job.cancel_requested = true;
        }
        Ok(Some(job))
    }

    async fn save(&self, job: &RefreshJob) -> Result<(), StoreError> {
        if let Some(stored) = self.read_record(job.id).await? {
            if stored.is_terminal() {
                return Ok(());
            }
        }
        self.write_record(job, self.options.active_record_ttl()).await?;

        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_script
            .key(LOCK_KEY)
            .arg(job.id.to_string())
            .arg(self.options.lock_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        if extended == 0 {
            warn!(job_id = %job.id, "refresh lock no longer held by running job");
        }
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let Some(job) = self.read_record(id).await? else {
            return Ok(CancelOutcome::Unknown);
        };
        if job.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(cancel_key(id))
            .arg("1")
            .arg("EX")
            .arg(self.options.active_record_ttl())
            .query_async(&mut conn)
            .await?;
        Ok(CancelOutcome::Requested)
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(cancel_key(id))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn finish(&self, job: &RefreshJob) -> Result<(), StoreError> {
        let already_terminal = self
            .read_record(job.id)
            .await?
            .map(|stored| stored.is_terminal())
            .unwrap_or(false);
        if !already_terminal {
            let mut record = job.clone();
            if !record.cancel_requested && self.is_cancel_requested(job.id).await? {
                record.cancel_requested = true;
            }
            self.write_record(&record, self.options.job_ttl_secs).await?;
        }

        let mut conn = self.conn.clone();
        let _: i64 = self
            .release_script
            .key(LOCK_KEY)
            .arg(job.id.to_string())
            .invoke_async(&mut conn)
            .await?;

        if job.status == JobStatus::Completed {
            let ts = job.finished_at.unwrap_or_else(Utc::now);
            let value = serde_json::to_string(&LastCompleted { ts: ts.to_rfc3339() })?;
            let _: () = redis::cmd("SET")
                .arg(LAST_COMPLETED_KEY)
                .arg(value)
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn active_job(&self) -> Result<Option<Uuid>, StoreError> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = redis::cmd("GET")
            .arg(LOCK_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(holder.and_then(|h| Uuid::parse_str(&h).ok()))
    }

    async fn last_successful_completion(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(LAST_COMPLETED_KEY)
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        // Unparseable values count as "never completed" so a refresh is due.
        let parsed = serde_json::from_str::<LastCompleted>(&raw)
            .ok()
            .and_then(|v| DateTime::parse_from_rfc3339(&v.ts).ok())
            .map(|ts| ts.with_timezone(&Utc));
        Ok(parsed)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
