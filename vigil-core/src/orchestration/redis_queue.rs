use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    config::RetryConfig,
    lease::{
        DeadLetter, LeaseId, LeaseReceipt, NackOutcome, ReclaimedTask,
        TaskLease,
    },
    queue::{QueueSnapshot, WorkQueue},
    task::AgentTask,
};
use crate::{
    error::{Result, ScanError},
    types::{ScanPriority, TaskId},
};

/// Most leases handed out by a single `lease` call.
const MAX_LEASE_BATCH: usize = 64;

mod scripts {
    use redis::Script;

    /// Inserts a task unless its id is already known.
    pub fn enqueue() -> Script {
        Script::new(
            r#"
            local prefix = ARGV[1]
            local id = ARGV[2]
            local task_key = prefix .. ':queue:task:' .. id
            if redis.call('EXISTS', task_key) == 1 then
                return 0
            end

            local seq = redis.call('INCR', prefix .. ':queue:seq')
            redis.call('HSET', task_key,
                'payload', ARGV[3], 'priority', ARGV[4], 'seq', seq, 'attempts', 0)

            if tonumber(ARGV[6]) > tonumber(ARGV[5]) then
                redis.call('ZADD', prefix .. ':queue:delayed', ARGV[6], id)
            else
                redis.call('ZADD', prefix .. ':queue:ready:' .. ARGV[4], seq, id)
            end
            return 1
            "#,
        )
    }

    /// Promotes due delayed tasks, then pops ready tasks tier by tier.
    pub fn lease() -> Script {
        Script::new(
            r#"
            local prefix = ARGV[1]
            local worker = ARGV[2]
            local now = tonumber(ARGV[3])
            local expires = tonumber(ARGV[4])
            local max = tonumber(ARGV[5])

            local delayed = prefix .. ':queue:delayed'
            local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', now)
            for _, id in ipairs(due) do
                redis.call('ZREM', delayed, id)
                local fields = redis.call('HMGET', prefix .. ':queue:task:' .. id, 'priority', 'seq')
                if fields[1] then
                    redis.call('ZADD', prefix .. ':queue:ready:' .. fields[1], fields[2], id)
                end
            end

            local out = {}
            for tier = 0, 3 do
                local ready = prefix .. ':queue:ready:' .. tier
                while #out < max do
                    local popped = redis.call('ZPOPMIN', ready)
                    if #popped == 0 then
                        break
                    end
                    local id = popped[1]
                    local task_key = prefix .. ':queue:task:' .. id
                    local fields = redis.call('HMGET', task_key, 'payload', 'attempts')
                    if fields[1] then
                        local lease_id = ARGV[6 + #out]
                        redis.call('HSET', task_key, 'lease_id', lease_id, 'worker', worker)
                        redis.call('ZADD', prefix .. ':queue:inflight', expires, id)
                        table.insert(out, {id, lease_id, fields[1], tostring(fields[2])})
                    end
                end
            end
            return out
            "#,
        )
    }

    /// Deletes a task if the caller still holds its lease.
    pub fn ack() -> Script {
        Script::new(
            r#"
            local task_key = ARGV[1] .. ':queue:task:' .. ARGV[2]
            if redis.call('HGET', task_key, 'lease_id') ~= ARGV[3] then
                return 0
            end
            redis.call('ZREM', ARGV[1] .. ':queue:inflight', ARGV[2])
            redis.call('DEL', task_key)
            return 1
            "#,
        )
    }

    /// Counts a failed attempt and requeues or dead-letters the task.
    /// Returns {-1} for a stale lease, {0, attempts} when requeued and
    /// {1, attempts} when dead-lettered.
    pub fn nack() -> Script {
        Script::new(
            r#"
            local prefix = ARGV[1]
            local id = ARGV[2]
            local task_key = prefix .. ':queue:task:' .. id
            if redis.call('HGET', task_key, 'lease_id') ~= ARGV[3] then
                return {-1}
            end

            redis.call('ZREM', prefix .. ':queue:inflight', id)
            redis.call('HDEL', task_key, 'lease_id', 'worker')
            local attempts = redis.call('HINCRBY', task_key, 'attempts', 1)

            if attempts >= tonumber(ARGV[6]) then
                local payload = redis.call('HGET', task_key, 'payload')
                redis.call('RPUSH', prefix .. ':queue:dead', cjson.encode({
                    payload = payload, attempts = attempts,
                    dead_at_ms = ARGV[4], reason = ARGV[7]
                }))
                redis.call('DEL', task_key)
                return {1, attempts}
            end

            local available = tonumber(ARGV[5])
            if available > tonumber(ARGV[4]) then
                redis.call('ZADD', prefix .. ':queue:delayed', available, id)
            else
                local fields = redis.call('HMGET', task_key, 'priority', 'seq')
                redis.call('ZADD', prefix .. ':queue:ready:' .. fields[1], fields[2], id)
            end
            return {0, attempts}
            "#,
        )
    }

    /// Returns expired leases to the ready set, counting the attempt.
    pub fn reclaim() -> Script {
        Script::new(
            r#"
            local prefix = ARGV[1]
            local now = tonumber(ARGV[2])
            local max_attempts = tonumber(ARGV[3])
            local inflight = prefix .. ':queue:inflight'

            local out = {}
            local expired = redis.call('ZRANGEBYSCORE', inflight, '-inf', now)
            for _, id in ipairs(expired) do
                redis.call('ZREM', inflight, id)
                local task_key = prefix .. ':queue:task:' .. id
                local fields = redis.call('HMGET', task_key, 'payload', 'priority', 'seq', 'worker')
                if fields[1] then
                    redis.call('HDEL', task_key, 'lease_id', 'worker')
                    local attempts = redis.call('HINCRBY', task_key, 'attempts', 1)
                    local reason = 'lease expired (worker ' .. tostring(fields[4]) .. ')'
                    if attempts >= max_attempts then
                        redis.call('RPUSH', prefix .. ':queue:dead', cjson.encode({
                            payload = fields[1], attempts = attempts,
                            dead_at_ms = ARGV[2], reason = reason
                        }))
                        redis.call('DEL', task_key)
                        table.insert(out, {fields[1], tostring(attempts), '1', tostring(fields[4])})
                    else
                        redis.call('ZADD', prefix .. ':queue:ready:' .. fields[2], fields[3], id)
                        table.insert(out, {fields[1], tostring(attempts), '0', tostring(fields[4])})
                    end
                end
            end
            return out
            "#,
        )
    }

    /// KEYS: dead list (oldest first). ARGV: cutoff ms, max kept.
    pub fn purge_dead_letters() -> Script {
        Script::new(
            r#"
            local removed = 0
            local max_kept = tonumber(ARGV[2])
            local len = redis.call('LLEN', KEYS[1])
            if len > max_kept then
                redis.call('LTRIM', KEYS[1], len - max_kept, -1)
                removed = len - max_kept
            end
            local cutoff = tonumber(ARGV[1])
            while true do
                local head = redis.call('LINDEX', KEYS[1], 0)
                if not head then
                    break
                end
                local ok, record = pcall(cjson.decode, head)
                local dead_at = ok and tonumber(record.dead_at_ms) or 0
                if dead_at and dead_at >= cutoff then
                    break
                end
                redis.call('LPOP', KEYS[1])
                removed = removed + 1
            end
            return removed
            "#,
        )
    }
}

/// Dead-letter record as written by the Lua scripts.
#[derive(Deserialize)]
struct DeadRecord {
    payload: String,
    attempts: u16,
    dead_at_ms: String,
    #[serde(default)]
    reason: String,
}

/// Work queue shared by every node through Redis.
///
/// Layout under `{prefix}:queue:`: one `ready:{tier}` sorted set per priority
/// scored by enqueue sequence, a `delayed` set scored by availability time,
/// an `inflight` set scored by lease expiry, a `task:{id}` hash per task and a
/// `dead` list. Every state transition is a single Lua script. Task keys are
/// derived inside the scripts, so the queue needs a single Redis node rather
/// than a cluster.
#[derive(Clone)]
pub struct RedisWorkQueue {
    conn: ConnectionManager,
    prefix: String,
    retry: RetryConfig,
    visibility: chrono::Duration,
}

impl fmt::Debug for RedisWorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisWorkQueue")
            .field("connection", &"ConnectionManager")
            .field("prefix", &self.prefix)
            .field("max_attempts", &self.retry.max_attempts)
            .field("visibility", &self.visibility)
            .finish()
    }
}

impl RedisWorkQueue {
    pub async fn connect(
        redis_url: &str,
        prefix: &str,
        retry: RetryConfig,
        visibility_timeout: Duration,
    ) -> Result<Self> {
        let conn = crate::redis_conn::connect(redis_url, "work queue").await?;
        Ok(Self::with_connection(conn, prefix, retry, visibility_timeout))
    }

    pub fn with_connection(
        conn: ConnectionManager,
        prefix: &str,
        retry: RetryConfig,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            retry,
            visibility: chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(15)),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:queue:{}", self.prefix, suffix)
    }

    fn decode_task(payload: &str, attempts: &str) -> Result<AgentTask> {
        let mut task: AgentTask = serde_json::from_str(payload)?;
        task.attempts = attempts.parse().unwrap_or(task.attempts);
        Ok(task)
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(
        &self,
        mut task: AgentTask,
        priority: ScanPriority,
        not_before: DateTime<Utc>,
    ) -> Result<TaskId> {
        task.priority = priority;
        let id = task.id;
        let payload = serde_json::to_string(&task)?;
        let mut conn = self.conn.clone();

        let script = scripts::enqueue();
        let inserted = script
            .arg(&self.prefix)
            .arg(id.to_string())
            .arg(payload)
            .arg(priority.tier())
            .arg(Utc::now().timestamp_millis())
            .arg(not_before.timestamp_millis())
            .invoke_async::<i64>(&mut conn)
            .await?;
        if inserted == 0 {
            debug!(target: "vigil::queue", task = %id, "duplicate enqueue ignored");
        }
        Ok(id)
    }

    async fn lease(
        &self,
        worker_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<TaskLease>> {
        let max_tasks = max_tasks.min(MAX_LEASE_BATCH);
        if max_tasks == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let expires_at = now + self.visibility;
        let lease_ids: Vec<String> =
            (0..max_tasks).map(|_| LeaseId::new().to_string()).collect();

        let mut conn = self.conn.clone();
        let script = scripts::lease();
        let mut invocation = script.prepare_invoke();
        invocation
            .arg(&self.prefix)
            .arg(worker_id)
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis())
            .arg(max_tasks);
        for lease_id in &lease_ids {
            invocation.arg(lease_id);
        }
        let rows = invocation
            .invoke_async::<Vec<Vec<String>>>(&mut conn)
            .await?;

        let mut leases = Vec::with_capacity(rows.len());
        for row in rows {
            let [_, lease_id, payload, attempts] = row.as_slice() else {
                warn!(target: "vigil::queue", "malformed lease row from Redis");
                continue;
            };
            let lease_id = Uuid::parse_str(lease_id)
                .map(LeaseId)
                .map_err(|e| ScanError::Internal(format!("bad lease id: {e}")))?;
            leases.push(TaskLease {
                lease_id,
                task: Self::decode_task(payload, attempts)?,
                worker_id: worker_id.to_string(),
                leased_at: now,
                expires_at,
            });
        }
        Ok(leases)
    }

    async fn ack(&self, receipt: &LeaseReceipt) -> Result<()> {
        let mut conn = self.conn.clone();
        let script = scripts::ack();
        let acked = script
            .arg(&self.prefix)
            .arg(receipt.task_id.to_string())
            .arg(receipt.lease_id.to_string())
            .invoke_async::<i64>(&mut conn)
            .await?;
        if acked == 1 {
            Ok(())
        } else {
            Err(ScanError::LeaseLost(format!(
                "task {} lease {}",
                receipt.task_id, receipt.lease_id
            )))
        }
    }

    async fn nack(
        &self,
        receipt: &LeaseReceipt,
        retry_delay: Duration,
        error: Option<String>,
    ) -> Result<NackOutcome> {
        let now = Utc::now();
        let available_at = now
            + chrono::Duration::from_std(retry_delay)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let mut conn = self.conn.clone();
        let script = scripts::nack();
        let reply = script
            .arg(&self.prefix)
            .arg(receipt.task_id.to_string())
            .arg(receipt.lease_id.to_string())
            .arg(now.timestamp_millis())
            .arg(available_at.timestamp_millis())
            .arg(self.retry.max_attempts)
            .arg(error.unwrap_or_default())
            .invoke_async::<Vec<i64>>(&mut conn)
            .await?;

        let attempts = reply
            .get(1)
            .and_then(|a| u16::try_from(*a).ok())
            .unwrap_or(self.retry.max_attempts);
        match reply.first() {
            Some(0) => Ok(NackOutcome::Requeued {
                attempts,
                available_at,
            }),
            Some(1) => Ok(NackOutcome::DeadLettered { attempts }),
            _ => Err(ScanError::LeaseLost(format!(
                "task {} lease {}",
                receipt.task_id, receipt.lease_id
            ))),
        }
    }

    async fn reclaim_expired(&self) -> Result<Vec<ReclaimedTask>> {
        let mut conn = self.conn.clone();
        let script = scripts::reclaim();
        let rows = script
            .arg(&self.prefix)
            .arg(Utc::now().timestamp_millis())
            .arg(self.retry.max_attempts)
            .invoke_async::<Vec<Vec<String>>>(&mut conn)
            .await?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in rows {
            let [payload, attempts, dead, worker] = row.as_slice() else {
                warn!(target: "vigil::queue", "malformed reclaim row from Redis");
                continue;
            };
            let task = Self::decode_task(payload, attempts)?;
            let dead_lettered = dead == "1";
            warn!(
                target: "vigil::queue",
                task = %task.id,
                job = %task.job_id,
                agent = %task.agent,
                worker = %worker,
                attempts = task.attempts,
                dead_lettered,
                "reclaimed expired lease"
            );
            reclaimed.push(ReclaimedTask {
                task,
                dead_lettered,
            });
        }
        Ok(reclaimed)
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        let mut conn = self.conn.clone();
        let (p0, p1, p2, p3, delayed, leased, dead): (
            usize,
            usize,
            usize,
            usize,
            usize,
            usize,
            usize,
        ) = redis::pipe()
            .zcard(self.key("ready:0"))
            .zcard(self.key("ready:1"))
            .zcard(self.key("ready:2"))
            .zcard(self.key("ready:3"))
            .zcard(self.key("delayed"))
            .zcard(self.key("inflight"))
            .llen(self.key("dead"))
            .query_async(&mut conn)
            .await?;

        let mut snapshot = QueueSnapshot::new(Utc::now());
        for (priority, count) in ScanPriority::ALL.into_iter().zip([p0, p1, p2, p3]) {
            snapshot.ready.insert(priority, count);
        }
        snapshot.delayed = delayed;
        snapshot.leased = leased;
        snapshot.dead_letter = dead;
        Ok(snapshot)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let start = -(limit.min(isize::MAX as usize) as isize);
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key("dead"))
            .arg(start)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut out = Vec::with_capacity(raw.len());
        for entry in raw.iter().rev() {
            let record: DeadRecord = match serde_json::from_str(entry) {
                Ok(record) => record,
                Err(err) => {
                    warn!(target: "vigil::queue", "skipping undecodable dead letter: {err}");
                    continue;
                }
            };
            let mut task: AgentTask = serde_json::from_str(&record.payload)?;
            task.attempts = record.attempts;
            out.push(DeadLetter {
                task,
                attempts: record.attempts,
                dead_at: from_millis(record.dead_at_ms.parse().unwrap_or_default()),
                reason: Some(record.reason).filter(|r| !r.is_empty()),
            });
        }
        Ok(out)
    }

    async fn purge_dead_letters(
        &self,
        older_than: DateTime<Utc>,
        max_kept: usize,
    ) -> Result<usize> {
        let mut conn = self.conn.clone();
        let removed = scripts::purge_dead_letters()
            .key(self.key("dead"))
            .arg(older_than.timestamp_millis())
            .arg(max_kept)
            .invoke_async::<usize>(&mut conn)
            .await?;
        if removed > 0 {
            debug!(target: "vigil::queue", removed, "purged dead letters");
        }
        Ok(removed)
    }
}
