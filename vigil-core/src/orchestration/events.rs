use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    error::Result,
    types::{AgentName, AgentSet, JobId, JobStatus, TaskOutcome},
};

/// Lifecycle notification emitted by the orchestrator for one job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JobEventPayload {
    Submitted {
        agents: AgentSet,
    },
    CacheHit,
    TasksEnqueued {
        count: usize,
    },
    AgentReported {
        agent: AgentName,
        outcome: TaskOutcome,
        attempts: u16,
    },
    Finalized {
        status: JobStatus,
        findings: usize,
    },
}

/// Job event with its envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub version: u16,
    pub event_id: Uuid,
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(job_id: JobId, payload: JobEventPayload) -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            job_id,
            at: Utc::now(),
            payload,
        }
    }

    /// True for the last event a job emits.
    pub fn is_final(&self) -> bool {
        matches!(self.payload, JobEventPayload::Finalized { .. })
    }
}

#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    async fn publish(&self, event: JobEvent) -> Result<()>;
}

/// In-process fan-out of job events. Slow subscribers lag and drop old
/// events; publishing never blocks the orchestrator.
pub struct InProcJobEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcJobEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcJobEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcJobEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcJobEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl JobEventPublisher for InProcJobEventBus {
    async fn publish(&self, event: JobEvent) -> Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Publisher that drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopJobEventPublisher;

#[async_trait]
impl JobEventPublisher for NoopJobEventPublisher {
    async fn publish(&self, _event: JobEvent) -> Result<()> {
        Ok(())
    }
}
