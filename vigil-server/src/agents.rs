//! Agents implemented as external commands.

use std::{
    env, fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use vigil_config::CommandAgentSpec;
use vigil_core::{
    orchestration::{
        AgentAdapter, AgentCapabilities, AgentError, AgentRegistry, ScanContext,
    },
    types::{AgentName, RawFinding, ScanTarget},
};

/// `EX_TEMPFAIL` from sysexits.h; tools use it to ask for a retry.
const EXIT_TEMPFAIL: i32 = 75;

/// Bytes of stderr kept in failure messages.
const STDERR_TAIL: usize = 2_048;

/// Runs a configured command per scan. The target is passed through
/// `VIGIL_*` environment variables and findings are read from stdout as a
/// JSON array.
pub struct CommandAdapter {
    name: AgentName,
    capabilities: AgentCapabilities,
    spec: CommandAgentSpec,
}

impl fmt::Debug for CommandAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandAdapter")
            .field("name", &self.name)
            .field("command", &self.spec.command)
            .field("args", &self.spec.args)
            .finish()
    }
}

impl CommandAdapter {
    pub fn from_spec(spec: CommandAgentSpec) -> Self {
        let mut capabilities = AgentCapabilities::for_languages(&spec.languages);
        capabilities.categories = spec.categories.iter().cloned().collect();
        capabilities.default_timeout = spec.timeout();
        capabilities.memory_mb = spec.memory_mb;
        Self {
            name: spec.name.clone(),
            capabilities,
            spec,
        }
    }

    fn command(&self, ctx: &ScanContext, target: &ScanTarget) -> Command {
        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .env("VIGIL_JOB_ID", ctx.job_id.to_string())
            .env("VIGIL_TASK_ID", ctx.task_id.to_string())
            .env("VIGIL_AGENT", self.name.as_str())
            .env("VIGIL_ATTEMPT", ctx.attempt.to_string())
            .env("VIGIL_DEADLINE", ctx.deadline.to_rfc3339())
            .env("VIGIL_REPOSITORY", &target.repository.id)
            .env("VIGIL_COMMIT", &target.commit)
            .env("VIGIL_SCAN_MODE", target.mode.to_string())
            .env("VIGIL_FILES", target.files.join("\n"))
            .env(
                "VIGIL_LANGUAGES",
                target.languages.iter().cloned().collect::<Vec<_>>().join(","),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(url) = &target.repository.url {
            cmd.env("VIGIL_REPOSITORY_URL", url);
        }
        if let Some(branch) = &target.branch {
            cmd.env("VIGIL_BRANCH", branch);
        }
        if let Some(memory) = ctx.memory_mb {
            cmd.env("VIGIL_MEMORY_MB", memory.to_string());
        }
        if let Some(shares) = ctx.cpu_shares {
            cmd.env("VIGIL_CPU_SHARES", shares.to_string());
        }
        for (key, value) in &ctx.settings {
            cmd.env(setting_var(key), value);
        }
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

fn setting_var(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("VIGIL_SETTING_{normalized}")
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_TAIL {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

fn parse_findings(stdout: &[u8]) -> Result<Vec<RawFinding>, AgentError> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(stdout)
        .map_err(|err| AgentError::Fatal(format!("unparseable agent output: {err}")))
}

#[async_trait]
impl AgentAdapter for CommandAdapter {
    fn name(&self) -> &AgentName {
        &self.name
    }

    fn capabilities(&self) -> &AgentCapabilities {
        &self.capabilities
    }

    async fn scan(
        &self,
        ctx: &ScanContext,
        target: &ScanTarget,
    ) -> Result<Vec<RawFinding>, AgentError> {
        let child = self.command(ctx, target).spawn().map_err(|err| {
            AgentError::Transient(format!(
                "failed to spawn {}: {err}",
                self.spec.command
            ))
        })?;
        debug!(target: "vigil::dispatch", agent = %self.name, pid = ?child.id(), "agent process started");

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|err| {
                AgentError::Transient(format!("failed to collect agent output: {err}"))
            })?,
            _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
        };

        match output.status.code() {
            Some(0) => parse_findings(&output.stdout),
            Some(EXIT_TEMPFAIL) => Err(AgentError::Transient(format!(
                "agent asked for a retry: {}",
                stderr_tail(&output.stderr)
            ))),
            Some(code) => Err(AgentError::Fatal(format!(
                "exit status {code}: {}",
                stderr_tail(&output.stderr)
            ))),
            None => {
                warn!(target: "vigil::dispatch", agent = %self.name, "agent process terminated by signal");
                Err(AgentError::Transient("terminated by signal".into()))
            }
        }
    }

    async fn health_check(&self) -> Result<(), AgentError> {
        if resolve_program(&self.spec.command).is_some() {
            Ok(())
        } else {
            Err(AgentError::Fatal(format!(
                "command {} not found",
                self.spec.command
            )))
        }
    }
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Builds the registry from the configured agent table.
pub fn build_registry(specs: &[CommandAgentSpec]) -> anyhow::Result<AgentRegistry> {
    let mut builder = AgentRegistry::builder();
    for spec in specs {
        builder = builder.register(Arc::new(CommandAdapter::from_spec(spec.clone())))?;
    }
    Ok(builder.build())
}
