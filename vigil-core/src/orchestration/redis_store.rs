use std::{fmt, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::warn;

use super::store::JobStore;
use crate::{
    error::{Result, ScanError},
    types::{JobId, ScanJob},
};

mod scripts {
    use redis::Script;

    /// KEYS: job hash, active set, all-jobs set. ARGV: job id, document,
    /// active flag.
    pub fn create() -> Script {
        Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 1 then
                return 0
            end
            redis.call('HSET', KEYS[1], 'rev', '0', 'doc', ARGV[2])
            redis.call('SADD', KEYS[3], ARGV[1])
            if ARGV[3] == '1' then
                redis.call('SADD', KEYS[2], ARGV[1])
            end
            return 1
            "#,
        )
    }

    /// KEYS: job hash, active set. ARGV: expected revision, new revision,
    /// document, terminal flag, job id, retention seconds for terminal jobs.
    pub fn compare_and_swap() -> Script {
        Script::new(
            r#"
            local current = redis.call('HGET', KEYS[1], 'rev')
            if not current then
                return -1
            end
            if current ~= ARGV[1] then
                return 0
            end
            redis.call('HSET', KEYS[1], 'rev', ARGV[2], 'doc', ARGV[3])
            if ARGV[4] == '1' then
                redis.call('SREM', KEYS[2], ARGV[5])
                local retention = tonumber(ARGV[6])
                if retention > 0 then
                    redis.call('EXPIRE', KEYS[1], retention)
                end
            else
                redis.call('SADD', KEYS[2], ARGV[5])
            end
            return 1
            "#,
        )
    }
}

/// Job records in Redis hashes (`rev`, `doc`), with revision checks done in
/// Lua so concurrent orchestrators serialize on each job.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    prefix: String,
    terminal_retention: Option<Duration>,
}

impl fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("connection", &"ConnectionManager")
            .field("prefix", &self.prefix)
            .field("terminal_retention", &self.terminal_retention)
            .finish()
    }
}

impl RedisJobStore {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self> {
        let conn = crate::redis_conn::connect(redis_url, "job store").await?;
        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            terminal_retention: None,
        }
    }

    /// Expire terminal job records after `retention`. Records are kept
    /// forever by default.
    pub fn with_terminal_retention(mut self, retention: Duration) -> Self {
        self.terminal_retention = Some(retention);
        self
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn active_key(&self) -> String {
        format!("{}:jobs:active", self.prefix)
    }

    fn all_key(&self) -> String {
        format!("{}:jobs:all", self.prefix)
    }
}

fn parse_ids(members: &[String]) -> Vec<JobId> {
    members
        .iter()
        .filter_map(|raw| {
            let id = JobId::parse(raw);
            if id.is_none() {
                warn!(target: "vigil::orchestrator", member = %raw, "ignoring malformed job id");
            }
            id
        })
        .collect()
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job: &ScanJob) -> Result<()> {
        let doc = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let script = scripts::create();
        let created = script
            .arg(job.id.to_string())
            .arg(doc)
            .arg(if job.status.is_terminal() { "0" } else { "1" })
            .key(self.job_key(job.id))
            .key(self.active_key())
            .key(self.all_key())
            .invoke_async::<i64>(&mut conn)
            .await?;
        if created == 1 {
            Ok(())
        } else {
            Err(ScanError::Internal(format!("job {} already exists", job.id)))
        }
    }

    async fn load(&self, id: JobId) -> Result<Option<ScanJob>> {
        let mut conn = self.conn.clone();
        let doc: Option<String> = conn.hget(self.job_key(id), "doc").await?;
        doc.map(|doc| serde_json::from_str(&doc).map_err(ScanError::from))
            .transpose()
    }

    async fn compare_and_swap(
        &self,
        job: &ScanJob,
        expected_revision: u64,
    ) -> Result<bool> {
        let doc = serde_json::to_string(job)?;
        let retention = self.terminal_retention.map_or(0, |d| d.as_secs());
        let mut conn = self.conn.clone();
        let script = scripts::compare_and_swap();
        let swapped = script
            .arg(expected_revision.to_string())
            .arg(job.revision.to_string())
            .arg(doc)
            .arg(if job.status.is_terminal() { "1" } else { "0" })
            .arg(job.id.to_string())
            .arg(retention)
            .key(self.job_key(job.id))
            .key(self.active_key())
            .invoke_async::<i64>(&mut conn)
            .await?;
        match swapped {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(ScanError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn list_active(&self) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(self.active_key()).await?;
        let mut ids = parse_ids(&members);
        ids.sort();
        Ok(ids)
    }

    async fn list_jobs(&self) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(self.all_key()).await?;
        let mut ids = parse_ids(&members);
        if ids.is_empty() {
            return Ok(ids);
        }

        // Terminal records may have expired; drop their ids from the index.
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.exists(self.job_key(*id));
        }
        let present: Vec<bool> = pipe.query_async(&mut conn).await?;
        let expired: Vec<String> = ids
            .iter()
            .zip(&present)
            .filter(|(_, present)| !**present)
            .map(|(id, _)| id.to_string())
            .collect();
        if !expired.is_empty() {
            let _: i64 = conn.srem(self.all_key(), &expired).await?;
            ids = ids
                .into_iter()
                .zip(present)
                .filter_map(|(id, present)| present.then_some(id))
                .collect();
        }

        ids.sort_by(|a, b| b.cmp(a));
        Ok(ids)
    }
}
