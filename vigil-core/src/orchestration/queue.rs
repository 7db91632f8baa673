use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    types::{ScanPriority, TaskId},
};

use super::{
    lease::{DeadLetter, LeaseReceipt, NackOutcome, ReclaimedTask, TaskLease},
    task::AgentTask,
};

/// Durable, priority-ordered, at-least-once channel between job admission
/// and the agent pool.
///
/// Ordering is strict across tiers and FIFO by original enqueue order within
/// a tier. A leased task stays invisible until it is acked, nacked, or its
/// visibility timeout lapses, after which [`WorkQueue::reclaim_expired`] hands
/// it out again.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Admit `task` for execution no earlier than `not_before`. Enqueueing a
    /// task id that is already queued or leased is a no-op.
    async fn enqueue(
        &self,
        task: AgentTask,
        priority: ScanPriority,
        not_before: DateTime<Utc>,
    ) -> Result<TaskId>;

    /// Atomically reserve up to `max_tasks` ready tasks for `worker_id`.
    async fn lease(
        &self,
        worker_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<TaskLease>>;

    /// Remove a leased task permanently.
    async fn ack(&self, receipt: &LeaseReceipt) -> Result<()>;

    /// Return a leased task after `retry_delay`, counting the attempt, or
    /// dead-letter it once the retry ceiling is reached.
    async fn nack(
        &self,
        receipt: &LeaseReceipt,
        retry_delay: Duration,
        error: Option<String>,
    ) -> Result<NackOutcome>;

    /// Re-queue tasks whose lease expired. Expiry counts as an attempt; tasks
    /// that run out of attempts this way are dead-lettered and returned with
    /// `dead_lettered` set so the caller can report them.
    async fn reclaim_expired(&self) -> Result<Vec<ReclaimedTask>>;

    async fn snapshot(&self) -> Result<QueueSnapshot>;

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Drop dead letters parked before `older_than`, then the oldest ones
    /// beyond `max_kept`. Returns how many were removed.
    async fn purge_dead_letters(
        &self,
        older_than: DateTime<Utc>,
        max_kept: usize,
    ) -> Result<usize>;

    /// Enqueue several tasks. Default implementation issues them one-by-one.
    async fn enqueue_many(
        &self,
        tasks: Vec<(AgentTask, ScanPriority)>,
        not_before: DateTime<Utc>,
    ) -> Result<Vec<TaskId>> {
        let mut out = Vec::with_capacity(tasks.len());
        for (task, priority) in tasks {
            out.push(self.enqueue(task, priority, not_before).await?);
        }
        Ok(out)
    }
}

/// Queue counters at a specific instant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub ready: BTreeMap<ScanPriority, usize>,
    pub delayed: usize,
    pub leased: usize,
    pub dead_letter: usize,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            ready: BTreeMap::new(),
            delayed: 0,
            leased: 0,
            dead_letter: 0,
        }
    }

    pub fn total_ready(&self) -> usize {
        self.ready.values().sum()
    }
}
