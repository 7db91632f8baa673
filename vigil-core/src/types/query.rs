use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    finding::{Category, ConsensusFinding, FindingStatus, Severity},
    ids::{AgentName, JobId},
    job::{JobStatus, ScanJob, ScanMode, ScanPriority, ScanResult},
};

/// Criteria for listing scan jobs. Unset fields match every job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanFilter {
    pub repository: Option<String>,
    pub status: Option<JobStatus>,
    pub mode: Option<ScanMode>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ScanFilter {
    pub fn matches(&self, job: &ScanJob) -> bool {
        self.repository
            .as_deref()
            .is_none_or(|repo| job.target.repository.id == repo)
            && self.status.is_none_or(|status| job.status == status)
            && self.mode.is_none_or(|mode| job.target.mode == mode)
            && self.created_after.is_none_or(|t| job.created_at >= t)
            && self.created_before.is_none_or(|t| job.created_at < t)
    }
}

/// Window into a listing; `offset` rows are skipped, then at most `limit`
/// are returned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Listing row for one job; carries counts instead of findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub id: JobId,
    pub repository: String,
    pub commit: String,
    pub mode: ScanMode,
    pub priority: ScanPriority,
    pub status: JobStatus,
    pub progress: f64,
    pub findings: usize,
    pub from_cache: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&ScanJob> for ScanSummary {
    fn from(job: &ScanJob) -> Self {
        Self {
            id: job.id,
            repository: job.target.repository.id.clone(),
            commit: job.target.commit.clone(),
            mode: job.target.mode,
            priority: job.priority,
            status: job.status,
            progress: job.progress(),
            findings: job.result.as_ref().map_or(0, |r| r.findings.len()),
            from_cache: job.from_cache,
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }
}

/// One page of [`ScanSummary`] rows, newest job first. `total` counts every
/// job matching the filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanList {
    pub scans: Vec<ScanSummary>,
    pub total: usize,
}

/// Narrows the findings of a completed job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FindingFilter {
    /// Keep findings at or above this severity.
    pub min_severity: Option<Severity>,
    /// Keep findings this agent contributed to.
    pub agent: Option<AgentName>,
    pub category: Option<String>,
    pub status: Option<FindingStatus>,
    /// Keep findings whose path starts with this prefix.
    pub file_prefix: Option<String>,
    pub min_score: Option<f64>,
    /// Keep only findings the agents disagreed on.
    pub disputed_only: bool,
}

impl FindingFilter {
    pub fn matches(&self, finding: &ConsensusFinding) -> bool {
        self.min_severity.is_none_or(|min| finding.severity >= min)
            && self
                .agent
                .as_ref()
                .is_none_or(|agent| finding.contributing_agents.contains(agent))
            && self
                .category
                .as_deref()
                .is_none_or(|c| finding.category == Category::new(c))
            && self.status.is_none_or(|status| finding.status == status)
            && self
                .file_prefix
                .as_deref()
                .is_none_or(|prefix| finding.file.starts_with(prefix))
            && self.min_score.is_none_or(|min| finding.score >= min)
            && (!self.disputed_only || finding.is_disputed())
    }

    /// Copy of `result` holding only the matching findings. Stats and the
    /// agent set still describe the whole result.
    pub fn apply(&self, result: &ScanResult) -> ScanResult {
        ScanResult {
            findings: result
                .findings
                .iter()
                .filter(|f| self.matches(f))
                .cloned()
                .collect(),
            stats: result.stats.clone(),
            agents: result.agents.clone(),
        }
    }
}
