use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AgentName, JobId, RawFinding, ScanPriority, ScanTarget, TaskId, TaskOutcome,
};

/// One agent's unit of work within a scan job, as carried by the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: TaskId,
    pub job_id: JobId,
    pub agent: AgentName,
    pub target: ScanTarget,
    pub priority: ScanPriority,
    /// Failed executions so far. Maintained by the queue.
    #[serde(default)]
    pub attempts: u16,
    pub enqueued_at: DateTime<Utc>,
    pub job_deadline: DateTime<Utc>,
}

impl AgentTask {
    pub fn new(
        job_id: JobId,
        agent: AgentName,
        target: ScanTarget,
        priority: ScanPriority,
        job_deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::for_agent(job_id, &agent),
            job_id,
            agent,
            target,
            priority,
            attempts: 0,
            enqueued_at: Utc::now(),
            job_deadline,
        }
    }
}

/// Terminal outcome of one agent task, delivered to the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub job_id: JobId,
    pub agent: AgentName,
    pub outcome: TaskOutcome,
    /// Executions used, including the one that produced this report.
    pub attempts: u16,
    #[serde(default)]
    pub findings: Vec<RawFinding>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentReport {
    pub fn succeeded(task: &AgentTask, findings: Vec<RawFinding>) -> Self {
        Self::build(task, TaskOutcome::Succeeded, findings, None)
    }

    pub fn failed(task: &AgentTask, error: impl Into<String>) -> Self {
        Self::build(task, TaskOutcome::Failed, Vec::new(), Some(error.into()))
    }

    pub fn timed_out(task: &AgentTask, error: impl Into<String>) -> Self {
        Self::build(task, TaskOutcome::TimedOut, Vec::new(), Some(error.into()))
    }

    pub fn skipped(task: &AgentTask, reason: impl Into<String>) -> Self {
        Self::build(task, TaskOutcome::Skipped, Vec::new(), Some(reason.into()))
    }

    fn build(
        task: &AgentTask,
        outcome: TaskOutcome,
        findings: Vec<RawFinding>,
        error: Option<String>,
    ) -> Self {
        Self {
            job_id: task.job_id,
            agent: task.agent.clone(),
            outcome,
            attempts: task.attempts.saturating_add(1),
            findings,
            error,
        }
    }
}
