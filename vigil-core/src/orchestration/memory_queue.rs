use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

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

#[derive(Clone, Debug)]
enum Slot {
    Ready,
    Delayed(DateTime<Utc>),
    Leased {
        lease_id: LeaseId,
        worker_id: String,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug)]
struct Entry {
    task: AgentTask,
    priority: ScanPriority,
    /// Original enqueue order; kept across retries so FIFO holds per tier.
    seq: u64,
    slot: Slot,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    entries: HashMap<TaskId, Entry>,
    ready: [BTreeSet<(u64, TaskId)>; 4],
    delayed: BTreeSet<(DateTime<Utc>, u64, TaskId)>,
    dead: Vec<DeadLetter>,
}

impl QueueState {
    fn enqueue(
        &mut self,
        mut task: AgentTask,
        priority: ScanPriority,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TaskId {
        let id = task.id;
        if self.entries.contains_key(&id) {
            debug!(target: "vigil::queue", task = %id, "duplicate enqueue ignored");
            return id;
        }

        task.priority = priority;
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = if not_before > now {
            self.delayed.insert((not_before, seq, id));
            Slot::Delayed(not_before)
        } else {
            self.ready[priority.tier()].insert((seq, id));
            Slot::Ready
        };
        self.entries.insert(
            id,
            Entry {
                task,
                priority,
                seq,
                slot,
            },
        );
        id
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(at, seq, id)) = self.delayed.first() {
            if at > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.slot = Slot::Ready;
                self.ready[entry.priority.tier()].insert((seq, id));
            }
        }
    }

    fn lease(
        &mut self,
        worker_id: &str,
        max_tasks: usize,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Vec<TaskLease> {
        self.promote_due(now);

        let mut leases = Vec::with_capacity(max_tasks);
        for tier in 0..self.ready.len() {
            while leases.len() < max_tasks {
                let Some((_, id)) = self.ready[tier].pop_first() else {
                    break;
                };
                let Some(entry) = self.entries.get_mut(&id) else {
                    continue;
                };
                let lease = TaskLease {
                    lease_id: LeaseId::new(),
                    task: entry.task.clone(),
                    worker_id: worker_id.to_string(),
                    leased_at: now,
                    expires_at: now + ttl,
                };
                entry.slot = Slot::Leased {
                    lease_id: lease.lease_id,
                    worker_id: worker_id.to_string(),
                    expires_at: lease.expires_at,
                };
                leases.push(lease);
            }
        }
        leases
    }

    fn held(&self, receipt: &LeaseReceipt) -> Result<&Entry> {
        let held = |entry: &&Entry| {
            matches!(
                &entry.slot,
                Slot::Leased { lease_id, .. } if *lease_id == receipt.lease_id
            )
        };
        match self.entries.get(&receipt.task_id).filter(held) {
            Some(entry) => Ok(entry),
            None => Err(ScanError::LeaseLost(format!(
                "task {} lease {}",
                receipt.task_id, receipt.lease_id
            ))),
        }
    }

    fn ack(&mut self, receipt: &LeaseReceipt) -> Result<()> {
        self.held(receipt)?;
        self.entries.remove(&receipt.task_id);
        Ok(())
    }

    /// Counts a failed attempt for `id` and either schedules it at
    /// `available_at` or dead-letters it. The entry must not be indexed in
    /// `ready`/`delayed` when this is called.
    fn retire_attempt(
        &mut self,
        id: TaskId,
        available_at: DateTime<Utc>,
        max_attempts: u16,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<NackOutcome> {
        let entry = self.entries.get_mut(&id)?;
        entry.task.attempts = entry.task.attempts.saturating_add(1);
        let attempts = entry.task.attempts;

        if attempts >= max_attempts {
            let entry = self.entries.remove(&id)?;
            self.dead.push(DeadLetter {
                task: entry.task,
                attempts,
                dead_at: now,
                reason,
            });
            return Some(NackOutcome::DeadLettered { attempts });
        }

        if available_at > now {
            entry.slot = Slot::Delayed(available_at);
            self.delayed.insert((available_at, entry.seq, id));
        } else {
            entry.slot = Slot::Ready;
            self.ready[entry.priority.tier()].insert((entry.seq, id));
        }
        Some(NackOutcome::Requeued {
            attempts,
            available_at,
        })
    }

    fn nack(
        &mut self,
        receipt: &LeaseReceipt,
        retry_delay: Duration,
        error: Option<String>,
        max_attempts: u16,
        now: DateTime<Utc>,
    ) -> Result<NackOutcome> {
        self.held(receipt)?;
        let delay = chrono::Duration::from_std(retry_delay)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.retire_attempt(
            receipt.task_id,
            now + delay,
            max_attempts,
            error,
            now,
        )
        .ok_or_else(|| {
            ScanError::Internal(format!(
                "task {} vanished during nack",
                receipt.task_id
            ))
        })
    }

    fn reclaim(
        &mut self,
        max_attempts: u16,
        now: DateTime<Utc>,
    ) -> Vec<ReclaimedTask> {
        let expired: Vec<(TaskId, String)> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| match &entry.slot {
                Slot::Leased {
                    expires_at,
                    worker_id,
                    ..
                } if *expires_at <= now => Some((*id, worker_id.clone())),
                _ => None,
            })
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (id, worker_id) in expired {
            let task = self.entries.get(&id).map(|e| e.task.clone());
            let outcome = self.retire_attempt(
                id,
                now,
                max_attempts,
                Some(format!("lease expired (worker {worker_id})")),
                now,
            );
            let (Some(mut task), Some(outcome)) = (task, outcome) else {
                continue;
            };
            let dead_lettered =
                matches!(outcome, NackOutcome::DeadLettered { .. });
            task.attempts = task.attempts.saturating_add(1);
            warn!(
                target: "vigil::queue",
                task = %id,
                job = %task.job_id,
                agent = %task.agent,
                worker = %worker_id,
                attempts = task.attempts,
                dead_lettered,
                "reclaimed expired lease"
            );
            reclaimed.push(ReclaimedTask {
                task,
                dead_lettered,
            });
        }
        reclaimed
    }

    fn purge_dead(&mut self, older_than: DateTime<Utc>, max_kept: usize) -> usize {
        let before = self.dead.len();
        self.dead.retain(|letter| letter.dead_at >= older_than);
        if self.dead.len() > max_kept {
            let excess = self.dead.len() - max_kept;
            self.dead.drain(..excess);
        }
        before - self.dead.len()
    }

    fn snapshot(&self, now: DateTime<Utc>) -> QueueSnapshot {
        let mut snapshot = QueueSnapshot::new(now);
        for priority in ScanPriority::ALL {
            snapshot
                .ready
                .insert(priority, self.ready[priority.tier()].len());
        }
        snapshot.delayed = self.delayed.len();
        snapshot.leased = self
            .entries
            .values()
            .filter(|e| matches!(e.slot, Slot::Leased { .. }))
            .count();
        snapshot.dead_letter = self.dead.len();
        snapshot
    }
}

/// Single-process work queue for tests and standalone deployments.
#[derive(Clone)]
pub struct InMemoryWorkQueue {
    state: Arc<Mutex<QueueState>>,
    retry: RetryConfig,
    visibility: chrono::Duration,
}

impl fmt::Debug for InMemoryWorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryWorkQueue");
        match self.state.try_lock() {
            Ok(guard) => debug.field("entries", &guard.entries.len()),
            Err(_) => debug.field("entries", &"<locked>"),
        };
        debug
            .field("max_attempts", &self.retry.max_attempts)
            .field("visibility", &self.visibility)
            .finish()
    }
}

impl InMemoryWorkQueue {
    pub fn new(retry: RetryConfig, visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            retry,
            visibility: chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(15)),
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(
        &self,
        task: AgentTask,
        priority: ScanPriority,
        not_before: DateTime<Utc>,
    ) -> Result<TaskId> {
        let mut state = self.state.lock().await;
        Ok(state.enqueue(task, priority, not_before, Utc::now()))
    }

    async fn lease(
        &self,
        worker_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<TaskLease>> {
        let mut state = self.state.lock().await;
        Ok(state.lease(worker_id, max_tasks, self.visibility, Utc::now()))
    }

    async fn ack(&self, receipt: &LeaseReceipt) -> Result<()> {
        self.state.lock().await.ack(receipt)
    }

    async fn nack(
        &self,
        receipt: &LeaseReceipt,
        retry_delay: Duration,
        error: Option<String>,
    ) -> Result<NackOutcome> {
        let mut state = self.state.lock().await;
        state.nack(
            receipt,
            retry_delay,
            error,
            self.retry.max_attempts,
            Utc::now(),
        )
    }

    async fn reclaim_expired(&self) -> Result<Vec<ReclaimedTask>> {
        let mut state = self.state.lock().await;
        Ok(state.reclaim(self.retry.max_attempts, Utc::now()))
    }

    async fn snapshot(&self) -> Result<QueueSnapshot> {
        Ok(self.state.lock().await.snapshot(Utc::now()))
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let state = self.state.lock().await;
        Ok(state.dead.iter().rev().take(limit).cloned().collect())
    }

    async fn purge_dead_letters(
        &self,
        older_than: DateTime<Utc>,
        max_kept: usize,
    ) -> Result<usize> {
        Ok(self.state.lock().await.purge_dead(older_than, max_kept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentName, JobId, ScanRequest};

    fn task(agent: &str) -> AgentTask {
        AgentTask::new(
            JobId::new(),
            AgentName::from(agent),
            ScanRequest::new("acme/api", "abc").target(),
            ScanPriority::P1,
            Utc::now() + chrono::Duration::minutes(5),
        )
    }

    fn ttl() -> chrono::Duration {
        chrono::Duration::seconds(30)
    }

    fn dead_letter(state: &mut QueueState, agent: &str, dead_at: DateTime<Utc>) {
        state.dead.push(DeadLetter {
            task: task(agent),
            attempts: 3,
            dead_at,
            reason: None,
        });
    }

    #[test]
    fn purge_drops_expired_then_oldest_dead_letters() {
        let mut state = QueueState::default();
        let now = Utc::now();
        dead_letter(&mut state, "stale", now - chrono::Duration::days(9));
        for agent in ["a", "b", "c"] {
            dead_letter(&mut state, agent, now);
        }

        assert_eq!(state.purge_dead(now - chrono::Duration::days(7), 2), 2);
        let kept: Vec<&str> =
            state.dead.iter().map(|d| d.task.agent.as_str()).collect();
        assert_eq!(kept, vec!["b", "c"]);
        assert_eq!(state.purge_dead(now - chrono::Duration::days(7), 2), 0);
    }

    #[test]
    fn higher_tier_always_leased_first() {
        let mut state = QueueState::default();
        let now = Utc::now();
        let low = state.enqueue(task("low"), ScanPriority::P3, now, now);
        let high = state.enqueue(task("high"), ScanPriority::P0, now, now);
        let mid = state.enqueue(task("mid"), ScanPriority::P1, now, now);

        let leased: Vec<TaskId> = state
            .lease("w", 3, ttl(), now)
            .into_iter()
            .map(|l| l.task.id)
            .collect();
        assert_eq!(leased, vec![high, mid, low]);
    }

    #[test]
    fn fifo_within_tier() {
        let mut state = QueueState::default();
        let now = Utc::now();
        let ids: Vec<TaskId> = ["a", "b", "c"]
            .into_iter()
            .map(|a| state.enqueue(task(a), ScanPriority::P2, now, now))
            .collect();

        for expected in ids {
            let lease = state.lease("w", 1, ttl(), now);
            assert_eq!(lease[0].task.id, expected);
        }
        assert!(state.lease("w", 1, ttl(), now).is_empty());
    }

    #[test]
    fn not_before_defers_visibility() {
        let mut state = QueueState::default();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(10);
        state.enqueue(task("x"), ScanPriority::P0, later, now);

        assert!(state.lease("w", 1, ttl(), now).is_empty());
        assert_eq!(state.lease("w", 1, ttl(), later).len(), 1);
    }

    #[test]
    fn duplicate_enqueue_is_ignored() {
        let mut state = QueueState::default();
        let now = Utc::now();
        let t = task("x");
        state.enqueue(t.clone(), ScanPriority::P1, now, now);
        state.enqueue(t, ScanPriority::P1, now, now);
        assert_eq!(state.lease("w", 10, ttl(), now).len(), 1);
    }

    #[test]
    fn leased_task_invisible_until_expiry_then_reclaimed() {
        let mut state = QueueState::default();
        let now = Utc::now();
        let id = state.enqueue(task("x"), ScanPriority::P1, now, now);
        let first = state.lease("crashed", 1, ttl(), now);
        assert_eq!(first.len(), 1);
        assert!(state.lease("other", 1, ttl(), now).is_empty());

        // Nothing is reclaimed before the visibility timeout.
        assert!(state.reclaim(3, now + chrono::Duration::seconds(29)).is_empty());

        let after = now + chrono::Duration::seconds(31);
        let reclaimed = state.reclaim(3, after);
        assert_eq!(reclaimed.len(), 1);
        assert!(!reclaimed[0].dead_lettered);

        let second = state.lease("other", 1, ttl(), after);
        assert_eq!(second[0].task.id, id);
        assert_eq!(second[0].task.attempts, 1);

        // The crashed worker's receipt is stale now.
        assert!(matches!(
            state.ack(&first[0].receipt()),
            Err(ScanError::LeaseLost(_))
        ));
        state.ack(&second[0].receipt()).unwrap();
    }

    #[test]
    fn nack_requeues_then_dead_letters() {
        let mut state = QueueState::default();
        let now = Utc::now();
        state.enqueue(task("x"), ScanPriority::P1, now, now);

        let lease = state.lease("w", 1, ttl(), now).remove(0);
        let outcome = state
            .nack(&lease.receipt(), Duration::from_secs(5), None, 2, now)
            .unwrap();
        assert!(matches!(outcome, NackOutcome::Requeued { attempts: 1, .. }));

        // Delayed: not visible yet.
        assert!(state.lease("w", 1, ttl(), now).is_empty());
        let later = now + chrono::Duration::seconds(6);
        let lease = state.lease("w", 1, ttl(), later).remove(0);
        assert_eq!(lease.task.attempts, 1);

        let outcome = state
            .nack(&lease.receipt(), Duration::ZERO, Some("boom".into()), 2, later)
            .unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered { attempts: 2 });
        assert_eq!(state.dead.len(), 1);
        assert_eq!(state.dead[0].reason.as_deref(), Some("boom"));
        assert!(state.entries.is_empty());
    }

    #[test]
    fn retried_task_keeps_its_place_in_line() {
        let mut state = QueueState::default();
        let now = Utc::now();
        let first = state.enqueue(task("first"), ScanPriority::P1, now, now);
        let lease = state.lease("w", 1, ttl(), now).remove(0);
        let second = state.enqueue(task("second"), ScanPriority::P1, now, now);

        state
            .nack(&lease.receipt(), Duration::ZERO, None, 5, now)
            .unwrap();
        let order: Vec<TaskId> = state
            .lease("w", 2, ttl(), now)
            .into_iter()
            .map(|l| l.task.id)
            .collect();
        assert_eq!(order, vec![first, second]);
    }

    #[test]
    fn expiry_past_ceiling_dead_letters() {
        let mut state = QueueState::default();
        let now = Utc::now();
        state.enqueue(task("x"), ScanPriority::P1, now, now);
        state.lease("w", 1, ttl(), now);
        let reclaimed = state.reclaim(1, now + chrono::Duration::minutes(1));
        assert_eq!(reclaimed.len(), 1);
        assert!(reclaimed[0].dead_lettered);
        assert_eq!(state.snapshot(now).dead_letter, 1);
    }

    #[tokio::test]
    async fn trait_surface_round_trip() {
        let queue = InMemoryWorkQueue::new(
            RetryConfig::default(),
            Duration::from_secs(60),
        );
        queue
            .enqueue(task("x"), ScanPriority::P0, Utc::now())
            .await
            .unwrap();
        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.total_ready(), 1);

        let leases = queue.lease("w", 4).await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(queue.snapshot().await.unwrap().leased, 1);
        queue.ack(&leases[0].receipt()).await.unwrap();

        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.total_ready() + snapshot.leased, 0);
    }
}
