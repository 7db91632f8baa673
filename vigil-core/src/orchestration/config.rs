use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    consensus::ConsensusConfig,
    error::{Result, ScanError},
    types::{AgentName, ScanMode},
};

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so deployments only need to supply the values
/// they want to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Work queue visibility, polling and housekeeping cadence.
    pub queue: QueueConfig,
    /// Retry/backoff/dead-letter policy shared by all workers.
    pub retry: RetryConfig,
    /// Agent pool size and per-agent execution limits.
    pub dispatcher: DispatcherConfig,
    /// Job deadlines per scan mode.
    pub jobs: JobConfig,
    /// Result cache toggles.
    pub cache: CacheConfig,
    /// Clustering window, agent weights and category taxonomy.
    pub consensus: ConsensusConfig,
}

impl OrchestratorConfig {
    /// Rejects combinations that would double-execute tasks or never make
    /// progress.
    pub fn validate(&self) -> Result<()> {
        // Intervals drive sleep loops and deadlines bound every job; zero
        // means a busy loop or a job that is over on arrival.
        for (field, value) in [
            ("queue.visibility_timeout_secs", self.queue.visibility_timeout_secs),
            ("queue.poll_interval_ms", self.queue.poll_interval_ms),
            ("queue.housekeeper_interval_ms", self.queue.housekeeper_interval_ms),
            (
                "dispatcher.default_agent_timeout_secs",
                self.dispatcher.default_agent_timeout_secs,
            ),
            (
                "dispatcher.cancel_poll_interval_ms",
                self.dispatcher.cancel_poll_interval_ms,
            ),
            ("jobs.full_deadline_secs", self.jobs.full_deadline_secs),
            (
                "jobs.incremental_deadline_secs",
                self.jobs.incremental_deadline_secs,
            ),
            (
                "jobs.interactive_deadline_secs",
                self.jobs.interactive_deadline_secs,
            ),
            ("jobs.sweep_interval_ms", self.jobs.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(ScanError::Config(format!(
                    "{field} must be greater than zero"
                )));
            }
        }
        if self.dispatcher.workers == 0 {
            return Err(ScanError::Config(
                "dispatcher.workers must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ScanError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.backoff_max_ms < self.retry.backoff_base_ms {
            return Err(ScanError::Config(
                "retry.backoff_max_ms must not be below retry.backoff_base_ms"
                    .into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(ScanError::Config(
                "retry.jitter_ratio must be within [0, 1]".into(),
            ));
        }

        let budget = self.dispatcher.max_agent_timeout()
            + self.dispatcher.scheduling_slack();
        if self.queue.visibility_timeout() <= budget {
            return Err(ScanError::Config(format!(
                "queue.visibility_timeout_secs ({}s) must exceed the largest agent timeout plus scheduling slack ({}s)",
                self.queue.visibility_timeout_secs,
                budget.as_secs()
            )));
        }

        self.consensus.validate()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a leased task stays invisible before it is re-queued.
    pub visibility_timeout_secs: u64,
    /// Idle sleep between lease attempts when the queue is empty (ms).
    pub poll_interval_ms: u64,
    /// Housekeeping cadence for reclaiming expired leases (ms).
    pub housekeeper_interval_ms: u64,
    /// Dead letters older than this are purged by the housekeeper.
    pub dead_letter_retention_secs: u64,
    /// Most dead letters kept; the oldest go first.
    pub dead_letter_max: usize,
    /// Namespace for every key written to a shared broker.
    pub key_prefix: String,
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeper_interval_ms)
    }

    pub fn dead_letter_retention(&self) -> Duration {
        Duration::from_secs(self.dead_letter_retention_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 15 * 60,
            poll_interval_ms: 250,
            housekeeper_interval_ms: 15_000,
            dead_letter_retention_secs: 7 * 24 * 60 * 60,
            dead_letter_max: 10_000,
            key_prefix: "vigil".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Executions allowed per task before it is dead-lettered.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so short delays still spread a bit.
    pub jitter_min_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Fixed number of workers; each runs at most one task at a time.
    pub workers: usize,
    /// Wall-clock limit for agents without an override (seconds).
    pub default_agent_timeout_secs: u64,
    /// Allowance for queueing and bookkeeping on top of agent timeouts.
    pub scheduling_slack_secs: u64,
    /// Treat agent timeouts like transient errors and retry them.
    pub retry_timeouts: bool,
    /// How often a running task re-checks whether its job was finalized
    /// elsewhere (ms).
    pub cancel_poll_interval_ms: u64,
    /// Per-agent execution overrides.
    pub agents: BTreeMap<AgentName, AgentOverride>,
}

impl DispatcherConfig {
    pub fn default_agent_timeout(&self) -> Duration {
        Duration::from_secs(self.default_agent_timeout_secs)
    }

    pub fn scheduling_slack(&self) -> Duration {
        Duration::from_secs(self.scheduling_slack_secs)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms.max(1))
    }

    pub fn agent(&self, agent: &AgentName) -> Option<&AgentOverride> {
        self.agents.get(agent)
    }

    /// Largest configured wall-clock limit across all agents.
    pub fn max_agent_timeout(&self) -> Duration {
        self.agents
            .values()
            .filter_map(|o| o.timeout_secs)
            .map(Duration::from_secs)
            .fold(self.default_agent_timeout(), Duration::max)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            default_agent_timeout_secs: 10 * 60,
            scheduling_slack_secs: 60,
            retry_timeouts: false,
            cancel_poll_interval_ms: 2_000,
            agents: BTreeMap::new(),
        }
    }
}

/// Execution limits for a single agent. Unset fields fall back to what the
/// adapter declares, then to the dispatcher defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOverride {
    pub timeout_secs: Option<u64>,
    pub memory_mb: Option<u64>,
    pub cpu_shares: Option<u32>,
    /// Free-form settings handed to the adapter with every scan.
    pub settings: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub full_deadline_secs: u64,
    pub incremental_deadline_secs: u64,
    pub interactive_deadline_secs: u64,
    /// Cadence of the sweeper that finalizes jobs past their deadline (ms).
    pub sweep_interval_ms: u64,
}

impl JobConfig {
    pub fn deadline_for(&self, mode: ScanMode) -> Duration {
        let secs = match mode {
            ScanMode::Full => self.full_deadline_secs,
            ScanMode::Incremental => self.incremental_deadline_secs,
            ScanMode::Interactive => self.interactive_deadline_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            full_deadline_secs: 30 * 60,
            incremental_deadline_secs: 15 * 60,
            interactive_deadline_secs: 2 * 60,
            sweep_interval_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 24 * 60 * 60,
        }
    }
}
