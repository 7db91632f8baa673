//! Core library for Vigil.
//!
//! Vigil runs several independent security-analysis tools ("agents") against
//! one code change and merges what they report into a single deduplicated set
//! of findings. The crate is split along the lifecycle of a scan:
//!
//! - [`orchestration`]: the durable work queue, the agent pool that executes
//!   leased tasks, and the [`ScanOrchestrator`] that owns the job state machine.
//! - [`consensus`]: clustering of raw findings and consensus scoring.
//! - [`cache`]: fingerprint-addressed storage of computed results.
//!
//! Storage and transport are abstracted behind [`orchestration::JobStore`],
//! [`orchestration::WorkQueue`] and [`cache::ResultCache`]; in-memory and Redis
//! bindings are provided.

pub mod cache;
pub mod consensus;
pub mod error;
pub mod orchestration;
#[cfg(feature = "redis")]
mod redis_conn;
pub mod types;

pub use error::{Result, ScanError};
pub use orchestration::{
    AgentAdapter, AgentPool, AgentRegistry, OrchestratorConfig,
    ScanOrchestrator,
};
pub use types::{
    AgentName, AgentSet, ConsensusFinding, JobId, JobStatus, RawFinding,
    ScanJob, ScanRequest,
};
