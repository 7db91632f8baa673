//! Job admission, the durable work queue and agent execution.
//!
//! The pieces fit together as follows: [`ScanOrchestrator::submit_scan`]
//! persists a [`ScanJob`](crate::types::ScanJob) and enqueues one
//! [`AgentTask`] per applicable agent on a [`WorkQueue`]. The [`AgentPool`]
//! leases tasks and hands them to the [`AgentTaskDispatcher`], whose terminal
//! outcomes flow back into the orchestrator through [`OutcomeSink`]. When the
//! last agent reports, the orchestrator runs consensus and caches the result.

pub mod agent;
pub mod backoff;
pub mod cancellation;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod lease;
pub mod memory_queue;
pub mod orchestrator;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod runtime;
pub mod store;
pub mod task;

pub use agent::{
    AgentAdapter, AgentCapabilities, AgentError, AgentRegistry,
    AgentRegistryBuilder, ScanContext,
};
pub use backoff::RetryPolicy;
pub use cancellation::CancellationRegistry;
pub use config::{
    AgentOverride, CacheConfig, DispatcherConfig, JobConfig, OrchestratorConfig,
    QueueConfig, RetryConfig,
};
pub use dispatcher::{AgentTaskDispatcher, DispatchStatus, TaskDispatcher};
pub use events::{
    InProcJobEventBus, JobEvent, JobEventPayload, JobEventPublisher,
    NoopJobEventPublisher,
};
pub use lease::{
    DeadLetter, LeaseId, LeaseReceipt, NackOutcome, ReclaimedTask, TaskLease,
};
pub use memory_queue::InMemoryWorkQueue;
pub use orchestrator::ScanOrchestrator;
pub use queue::{QueueSnapshot, WorkQueue};
#[cfg(feature = "redis")]
pub use redis_queue::RedisWorkQueue;
#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
pub use runtime::{AgentPool, OutcomeSink};
pub use store::{InMemoryJobStore, JobStore};
pub use task::{AgentReport, AgentTask};
