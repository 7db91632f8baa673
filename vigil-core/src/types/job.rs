use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    cache::Fingerprint,
    error::{Result, ScanError},
};

use super::{
    finding::{ConsensusFinding, ConsensusStats, RawFinding},
    ids::{AgentName, AgentSet, JobId},
};

/// How much of the repository a scan covers. Drives the job deadline.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    #[default]
    Full,
    Incremental,
    Interactive,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Full => write!(f, "full"),
            ScanMode::Incremental => write!(f, "incremental"),
            ScanMode::Interactive => write!(f, "interactive"),
        }
    }
}

/// Queue tiers. A lower tier is never leased while a higher one has ready
/// work; `P0` is the highest.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum ScanPriority {
    P0 = 0,
    #[default]
    P1 = 1,
    P2 = 2,
    P3 = 3,
}

impl ScanPriority {
    /// All tiers, highest first.
    pub const ALL: [ScanPriority; 4] = [
        ScanPriority::P0,
        ScanPriority::P1,
        ScanPriority::P2,
        ScanPriority::P3,
    ];

    pub fn tier(self) -> usize {
        self as usize
    }

    pub fn from_tier(tier: u8) -> Option<Self> {
        match tier {
            0 => Some(ScanPriority::P0),
            1 => Some(ScanPriority::P1),
            2 => Some(ScanPriority::P2),
            3 => Some(ScanPriority::P3),
            _ => None,
        }
    }
}

/// Job lifecycle: `Queued -> Running -> {Completed, Failed, Cancelled}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            // Cache hits, zero-agent jobs and admission failures finalize
            // straight from `Queued`.
            (JobStatus::Queued, _) => next.is_terminal(),
            (JobStatus::Running, _) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Repository identity plus an optional location to fetch it from.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl RepositoryRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: None,
        }
    }
}

/// What an agent is asked to scan.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScanTarget {
    pub repository: RepositoryRef,
    pub commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// File subset for incremental and interactive scans; empty means the
    /// whole tree.
    #[serde(default)]
    pub files: Vec<String>,
    /// Detected languages, lowercase.
    #[serde(default)]
    pub languages: BTreeSet<String>,
    #[serde(default)]
    pub mode: ScanMode,
}

/// Submission payload for a new scan.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScanRequest {
    pub repository: String,
    #[serde(default)]
    pub repository_url: Option<String>,
    pub commit: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub mode: ScanMode,
    #[serde(default)]
    pub priority: ScanPriority,
    /// Explicit agent override; when absent the set is derived from
    /// `languages`.
    #[serde(default)]
    pub agents: Option<Vec<String>>,
}

impl ScanRequest {
    pub fn new(repository: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            commit: commit.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.repository.trim().is_empty() {
            return Err(ScanError::InvalidRequest(
                "repository is required".into(),
            ));
        }
        if self.commit.trim().is_empty() {
            return Err(ScanError::InvalidRequest("commit is required".into()));
        }
        if let Some(agents) = &self.agents
            && agents.iter().any(|a| a.trim().is_empty())
        {
            return Err(ScanError::InvalidRequest(
                "agent names must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn target(&self) -> ScanTarget {
        ScanTarget {
            repository: RepositoryRef {
                id: self.repository.trim().to_string(),
                url: self.repository_url.clone(),
            },
            commit: self.commit.trim().to_string(),
            branch: self.branch.clone(),
            files: self.files.clone(),
            languages: self
                .languages
                .iter()
                .map(|l| l.trim().to_ascii_lowercase())
                .filter(|l| !l.is_empty())
                .collect(),
            mode: self.mode,
        }
    }
}

/// Per-agent outcome as tracked on the job record.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    #[default]
    Pending,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl TaskOutcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskOutcome::Pending)
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskOutcome::Pending => "pending",
            TaskOutcome::Succeeded => "succeeded",
            TaskOutcome::Failed => "failed",
            TaskOutcome::TimedOut => "timed out",
            TaskOutcome::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Sub-status of one agent inside a job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskState {
    pub outcome: TaskOutcome,
    #[serde(default)]
    pub attempts: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<RawFinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentTaskState {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Skipped,
            error: Some(reason.into()),
            finished_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

/// Consensus output attached to a completed job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub findings: Vec<ConsensusFinding>,
    #[serde(default)]
    pub stats: ConsensusStats,
    /// Agents whose findings fed the result. Smaller than the requested set
    /// when coverage was degraded.
    pub agents: AgentSet,
}

/// One request to analyze a repository at a commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: JobId,
    pub target: ScanTarget,
    pub priority: ScanPriority,
    pub status: JobStatus,
    /// Key set is fixed when the job is created.
    pub agents: BTreeMap<AgentName, AgentTaskState>,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline_at: DateTime<Utc>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub result: Option<ScanResult>,
    #[serde(default)]
    pub from_cache: bool,
    /// Bumped on every stored update; used for compare-and-swap.
    #[serde(default)]
    pub revision: u64,
}

impl ScanJob {
    pub fn new(
        target: ScanTarget,
        priority: ScanPriority,
        agents: &AgentSet,
        fingerprint: Fingerprint,
        deadline_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            target,
            priority,
            status: JobStatus::Queued,
            agents: agents
                .iter()
                .map(|a| (a.clone(), AgentTaskState::default()))
                .collect(),
            fingerprint,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            deadline_at,
            failure_reason: None,
            result: None,
            from_cache: false,
            revision: 0,
        }
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ScanError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn requested_agents(&self) -> AgentSet {
        self.agents.keys().cloned().collect()
    }

    pub fn agents_with(&self, outcome: TaskOutcome) -> AgentSet {
        self.agents
            .iter()
            .filter(|(_, state)| state.outcome == outcome)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn pending_agents(&self) -> AgentSet {
        self.agents_with(TaskOutcome::Pending)
    }

    pub fn all_agents_terminal(&self) -> bool {
        self.agents.values().all(|s| s.outcome.is_terminal())
    }

    /// Fraction of agents that reached a terminal outcome, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.status.is_terminal() || self.agents.is_empty() {
            return if self.status.is_terminal() { 1.0 } else { 0.0 };
        }
        let done = self
            .agents
            .values()
            .filter(|s| s.outcome.is_terminal())
            .count();
        done as f64 / self.agents.len() as f64
    }

    /// Raw findings gathered from every agent that succeeded.
    pub fn collected_findings(&self) -> Vec<RawFinding> {
        self.agents
            .values()
            .filter(|s| s.outcome == TaskOutcome::Succeeded)
            .flat_map(|s| s.findings.iter().cloned())
            .collect()
    }

    /// `agent: outcome (detail)` for every agent that did not succeed.
    pub fn failure_summary(&self) -> String {
        let parts: Vec<String> = self
            .agents
            .iter()
            .filter(|(_, s)| {
                !matches!(
                    s.outcome,
                    TaskOutcome::Succeeded | TaskOutcome::Skipped
                )
            })
            .map(|(name, s)| match &s.error {
                Some(err) => format!("{name}: {} ({err})", s.outcome),
                None => format!("{name}: {}", s.outcome),
            })
            .collect();
        if parts.is_empty() {
            "no agent produced results".to_string()
        } else {
            format!("all agents failed: {}", parts.join("; "))
        }
    }
}
