//! Domain records shared by the orchestrator, consensus engine and cache.

pub mod finding;
pub mod ids;
pub mod job;
pub mod query;

pub use finding::{
    Category, ConsensusFinding, ConsensusStats, FindingStatus, FixSuggestion,
    LineRange, RawFinding, Severity,
};
pub use ids::{AgentName, AgentSet, FindingId, JobId, TaskId};
pub use job::{
    AgentTaskState, JobStatus, RepositoryRef, ScanJob, ScanMode, ScanPriority,
    ScanRequest, ScanResult, ScanTarget, TaskOutcome,
};
pub use query::{FindingFilter, Page, ScanFilter, ScanList, ScanSummary};
