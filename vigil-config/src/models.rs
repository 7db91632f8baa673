use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use vigil_core::{OrchestratorConfig, types::AgentName};

pub(crate) const DEFAULT_LOG_FILTER: &str = "info,vigil::dispatch=info";

/// Source that produced the deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VigilConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Everything a Vigil process needs to start: orchestrator tuning, the Redis
/// endpoint for shared state and the command-line agents to register.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Queue, retry, dispatcher, deadline, cache and consensus tuning.
    pub orchestrator: OrchestratorConfig,
    /// Redis endpoint for the work queue, job store and result cache. When
    /// absent, a single process keeps everything in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// `tracing` filter directive used when `RUST_LOG` is not set.
    pub log_filter: String,
    /// Agents invoked as subprocesses.
    pub agents: Vec<CommandAgentSpec>,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            redis_url: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            agents: Vec::new(),
        }
    }
}

impl VigilConfig {
    /// Checks orchestrator invariants plus the agent table.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.orchestrator
            .validate()
            .context("invalid orchestrator configuration")?;

        if let Some(url) = &self.redis_url {
            let scheme_ok = ["redis://", "rediss://", "unix://", "redis+unix://"]
                .iter()
                .any(|scheme| url.starts_with(scheme));
            if !scheme_ok {
                bail!("redis_url must be a redis://, rediss:// or unix:// URL, got {url}");
            }
        }

        let mut seen = BTreeSet::new();
        for agent in &self.agents {
            agent.validate()?;
            if !seen.insert(agent.name.clone()) {
                bail!("agent {} is configured more than once", agent.name);
            }
        }

        // A subprocess timeout beyond the visibility window would let another
        // worker lease the task while the first is still running.
        let visibility = self.orchestrator.queue.visibility_timeout();
        let slack = self.orchestrator.dispatcher.scheduling_slack();
        for agent in &self.agents {
            if let Some(timeout) = agent.timeout()
                && timeout + slack >= visibility
            {
                bail!(
                    "agent {} timeout ({}s) plus scheduling slack must stay below queue.visibility_timeout_secs ({}s)",
                    agent.name,
                    timeout.as_secs(),
                    visibility.as_secs()
                );
            }
        }
        Ok(())
    }

    /// `$VIGIL_REDIS_URL` wins over whatever the file said.
    pub(crate) fn apply_env_overrides(
        &mut self,
        lookup: &impl Fn(&str) -> Option<String>,
    ) {
        if let Some(url) = lookup("VIGIL_REDIS_URL")
            && !url.trim().is_empty()
        {
            self.redis_url = Some(url.trim().to_string());
        }
        if let Some(filter) = lookup("VIGIL_LOG_FILTER")
            && !filter.trim().is_empty()
        {
            self.log_filter = filter.trim().to_string();
        }
    }
}

/// An agent backed by an external command.
///
/// The command receives the scan target through `VIGIL_*` environment
/// variables and must print a JSON array of raw findings on stdout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandAgentSpec {
    pub name: AgentName,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Languages the tool understands; empty means language-agnostic.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Vulnerability categories the tool is known to detect.
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Extra environment passed to the command as-is.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CommandAgentSpec {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            bail!("agent name must not be empty");
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            bail!("agent name {name:?} may only contain ASCII letters, digits, '-', '_' and '.'");
        }
        if self.command.trim().is_empty() {
            bail!("agent {name} has no command");
        }
        if self.timeout_secs == Some(0) {
            bail!("agent {name} timeout_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> CommandAgentSpec {
        CommandAgentSpec {
            name: AgentName::from(name),
            command: "/usr/bin/true".into(),
            args: Vec::new(),
            languages: Vec::new(),
            categories: Vec::new(),
            timeout_secs: None,
            memory_mb: None,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn defaults_validate() {
        let config = VigilConfig::default();
        config.validate().expect("defaults are valid");
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn duplicate_agents_are_rejected() {
        let config = VigilConfig {
            agents: vec![agent("semgrep"), agent("semgrep")],
            ..VigilConfig::default()
        };
        let err = config.validate().expect_err("duplicate agent");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn agent_timeout_must_fit_visibility_window() {
        let mut slow = agent("slow");
        slow.timeout_secs = Some(3_600);
        let config = VigilConfig {
            agents: vec![slow],
            ..VigilConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_redis_urls() {
        let config = VigilConfig {
            redis_url: Some("http://localhost:6379".into()),
            ..VigilConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_redis_url() {
        let mut config = VigilConfig::default();
        config.apply_env_overrides(&|key: &str| {
            (key == "VIGIL_REDIS_URL").then(|| " redis://cache:6379/2 ".to_string())
        });
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379/2"));
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }
}
