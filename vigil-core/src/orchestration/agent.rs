use std::{
    any::type_name_of_val,
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Result, ScanError},
    types::{AgentName, AgentSet, JobId, RawFinding, ScanTarget, TaskId},
};

/// What an adapter can scan and what it needs to do so.
#[derive(Clone, Debug, Default)]
pub struct AgentCapabilities {
    /// Lowercase language identifiers. Empty means language-agnostic
    /// (secret scanners, dependency audits).
    pub languages: BTreeSet<String>,
    /// Shared-taxonomy categories the agent reports on.
    pub categories: BTreeSet<String>,
    pub default_timeout: Option<Duration>,
    pub memory_mb: Option<u64>,
    pub cpu_shares: Option<u32>,
}

impl AgentCapabilities {
    pub fn for_languages<I, S>(languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            languages: languages
                .into_iter()
                .map(|l| l.as_ref().trim().to_ascii_lowercase())
                .collect(),
            ..Self::default()
        }
    }

    pub fn is_language_agnostic(&self) -> bool {
        self.languages.is_empty()
    }

    /// Whether the agent has anything to say about a tree containing
    /// `detected` languages.
    pub fn applies_to(&self, detected: &BTreeSet<String>) -> bool {
        self.is_language_agnostic()
            || self.languages.iter().any(|l| detected.contains(l))
    }
}

/// Execution context handed to an adapter for one attempt.
#[derive(Clone, Debug)]
pub struct ScanContext {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub agent: AgentName,
    /// 1-based attempt number.
    pub attempt: u16,
    /// Hard wall-clock deadline; the dispatcher abandons the attempt here.
    pub deadline: DateTime<Utc>,
    pub memory_mb: Option<u64>,
    pub cpu_shares: Option<u32>,
    pub settings: BTreeMap<String, String>,
    /// Fires when the job is cancelled or finalized.
    pub cancel: CancellationToken,
}

impl ScanContext {
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Failure reported by an adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Network hiccups, resource exhaustion; worth retrying.
    #[error("transient agent failure: {0}")]
    Transient(String),
    /// Crashes, unparseable output, misconfiguration; retrying won't help.
    #[error("agent failed: {0}")]
    Fatal(String),
    #[error("agent observed cancellation")]
    Cancelled,
}

/// Uniform capability wrapping one scanning tool.
///
/// Implementations must honour `ctx.cancel` and `ctx.deadline` and be safe to
/// call concurrently for different jobs.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn name(&self) -> &AgentName;

    fn capabilities(&self) -> &AgentCapabilities;

    async fn scan(
        &self,
        ctx: &ScanContext,
        target: &ScanTarget,
    ) -> std::result::Result<Vec<RawFinding>, AgentError>;

    /// Cheap readiness probe (binary present, service reachable).
    async fn health_check(&self) -> std::result::Result<(), AgentError> {
        Ok(())
    }
}

/// Closed set of adapters, fixed at startup.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    adapters: BTreeMap<AgentName, Arc<dyn AgentAdapter>>,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let adapters: BTreeMap<&str, &str> = self
            .adapters
            .iter()
            .map(|(name, adapter)| {
                (name.as_str(), type_name_of_val(adapter.as_ref()))
            })
            .collect();
        f.debug_struct("AgentRegistry")
            .field("adapters", &adapters)
            .finish()
    }
}

impl AgentRegistry {
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder::default()
    }

    pub fn get(&self, name: &AgentName) -> Option<Arc<dyn AgentAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn contains(&self, name: &AgentName) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn names(&self) -> AgentSet {
        self.adapters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Agents applicable to a tree containing `languages`.
    pub fn agents_for_languages(&self, languages: &BTreeSet<String>) -> AgentSet {
        self.adapters
            .iter()
            .filter(|(_, adapter)| adapter.capabilities().applies_to(languages))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Runs every adapter's health probe concurrently.
    pub async fn health_report(
        &self,
    ) -> BTreeMap<AgentName, std::result::Result<(), AgentError>> {
        let probes = self.adapters.iter().map(|(name, adapter)| async move {
            (name.clone(), adapter.health_check().await)
        });
        futures::future::join_all(probes).await.into_iter().collect()
    }
}

#[derive(Default)]
pub struct AgentRegistryBuilder {
    adapters: BTreeMap<AgentName, Arc<dyn AgentAdapter>>,
}

impl fmt::Debug for AgentRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistryBuilder")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentRegistryBuilder {
    pub fn register(mut self, adapter: Arc<dyn AgentAdapter>) -> Result<Self> {
        let name = adapter.name().clone();
        if name.as_str().trim().is_empty() {
            return Err(ScanError::Config("agent name must not be empty".into()));
        }
        if self.adapters.contains_key(&name) {
            return Err(ScanError::Config(format!(
                "agent {name} registered twice"
            )));
        }
        self.adapters.insert(name, adapter);
        Ok(self)
    }

    pub fn build(self) -> AgentRegistry {
        AgentRegistry {
            adapters: self.adapters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct StaticAgent {
        name: AgentName,
        caps: AgentCapabilities,
    }

    #[async_trait]
    impl AgentAdapter for StaticAgent {
        fn name(&self) -> &AgentName {
            &self.name
        }

        fn capabilities(&self) -> &AgentCapabilities {
            &self.caps
        }

        async fn scan(
            &self,
            _ctx: &ScanContext,
            _target: &ScanTarget,
        ) -> std::result::Result<Vec<RawFinding>, AgentError> {
            Ok(Vec::new())
        }
    }

    fn agent(name: &str, languages: &[&str]) -> Arc<dyn AgentAdapter> {
        Arc::new(StaticAgent {
            name: AgentName::from(name),
            caps: AgentCapabilities::for_languages(languages),
        })
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::builder()
            .register(agent("gosec", &["go"]))
            .unwrap()
            .register(agent("bandit", &["python"]))
            .unwrap()
            .register(agent("gitleaks", &[]))
            .unwrap()
            .build()
    }

    #[test]
    fn selects_agents_by_language() {
        let registry = registry();
        let go: BTreeSet<String> = ["go".to_string()].into();
        let selected: Vec<String> = registry
            .agents_for_languages(&go)
            .into_iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(selected, vec!["gitleaks", "gosec"]);
    }

    #[test]
    fn language_agnostic_agent_always_applies() {
        let registry = registry();
        let selected = registry.agents_for_languages(&BTreeSet::new());
        assert_eq!(selected.len(), 1);
        assert!(selected.contains("gitleaks"));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let result = AgentRegistry::builder()
            .register(agent("gosec", &["go"]))
            .unwrap()
            .register(agent("gosec", &["go"]));
        assert!(matches!(result, Err(ScanError::Config(_))));
    }

    #[tokio::test]
    async fn health_report_covers_every_agent() {
        let report = registry().health_report().await;
        assert_eq!(report.len(), 3);
        assert!(report.values().all(|r| r.is_ok()));
    }
}
