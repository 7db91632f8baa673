use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::task::AgentTask;
use crate::types::TaskId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lease metadata returned when a worker reserves a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskLease {
    pub lease_id: LeaseId,
    pub task: AgentTask,
    pub worker_id: String,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TaskLease {
    pub fn new(task: AgentTask, worker_id: &str, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            lease_id: LeaseId::new(),
            task,
            worker_id: worker_id.to_string(),
            leased_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn receipt(&self) -> LeaseReceipt {
        LeaseReceipt {
            task_id: self.task.id,
            lease_id: self.lease_id,
        }
    }
}

/// Proof of ownership presented on ack/nack. A receipt whose lease was
/// reclaimed and handed to another worker is rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseReceipt {
    pub task_id: TaskId,
    pub lease_id: LeaseId,
}

/// Result of returning a task to the queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NackOutcome {
    Requeued {
        attempts: u16,
        available_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u16,
    },
}

/// A task whose lease expired without ack/nack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReclaimedTask {
    pub task: AgentTask,
    /// True when the expiry exhausted the retry budget.
    pub dead_lettered: bool,
}

/// Task parked after exhausting its retries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: AgentTask,
    pub attempts: u16,
    pub dead_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}
