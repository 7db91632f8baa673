use std::{any::type_name, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};

use super::{
    agent::{AgentAdapter, AgentError, AgentRegistry, ScanContext},
    cancellation::CancellationRegistry,
    config::DispatcherConfig,
    lease::TaskLease,
    store::JobStore,
    task::{AgentReport, AgentTask},
};
use crate::types::{JobId, TaskOutcome};

/// Outcome of dispatcher execution for a single leased task.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchStatus {
    /// The agent reached a terminal outcome; report it, then ack.
    Completed(AgentReport),
    /// Transient failure; nack with backoff.
    Retry { error: String },
    /// The job no longer wants this result; ack without reporting.
    Discard { reason: String },
}

impl DispatchStatus {
    pub fn needs_retry(&self) -> bool {
        matches!(self, DispatchStatus::Retry { .. })
    }
}

/// Contract exposed to worker loops for executing leased tasks.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, lease: &TaskLease) -> DispatchStatus;
}

enum Attempt {
    Finished(std::result::Result<Vec<crate::types::RawFinding>, AgentError>),
    TimedOut(Duration),
    /// The job's token fired in this process.
    Cancelled,
    /// The stored job turned terminal, possibly in another process.
    JobFinished,
}

/// Runs one agent attempt under its timeout, memory and CPU hints, and the
/// job's cancellation token.
pub struct AgentTaskDispatcher<S>
where
    S: JobStore + 'static,
{
    store: Arc<S>,
    registry: Arc<AgentRegistry>,
    cancellations: CancellationRegistry,
    config: DispatcherConfig,
}

impl<S> fmt::Debug for AgentTaskDispatcher<S>
where
    S: JobStore + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentTaskDispatcher")
            .field("store", &type_name::<S>())
            .field("registry", &self.registry)
            .field("cancellations", &self.cancellations)
            .field("config", &self.config)
            .finish()
    }
}

impl<S> AgentTaskDispatcher<S>
where
    S: JobStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        registry: Arc<AgentRegistry>,
        cancellations: CancellationRegistry,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            cancellations,
            config,
        }
    }

    fn timeout_for(&self, task: &AgentTask, adapter: &dyn AgentAdapter) -> Duration {
        self.config
            .agent(&task.agent)
            .and_then(|o| o.timeout_secs)
            .map(Duration::from_secs)
            .or(adapter.capabilities().default_timeout)
            .unwrap_or_else(|| self.config.default_agent_timeout())
    }

    fn context_for(
        &self,
        task: &AgentTask,
        adapter: &dyn AgentAdapter,
        deadline: chrono::DateTime<Utc>,
        cancel: CancellationToken,
    ) -> ScanContext {
        let overrides = self.config.agent(&task.agent);
        let caps = adapter.capabilities();
        ScanContext {
            job_id: task.job_id,
            task_id: task.id,
            agent: task.agent.clone(),
            attempt: task.attempts.saturating_add(1),
            deadline,
            memory_mb: overrides.and_then(|o| o.memory_mb).or(caps.memory_mb),
            cpu_shares: overrides.and_then(|o| o.cpu_shares).or(caps.cpu_shares),
            settings: overrides.map(|o| o.settings.clone()).unwrap_or_default(),
            cancel,
        }
    }

    /// Resolves once the stored job reaches a terminal status or disappears.
    /// Covers cancellations issued by other processes.
    async fn job_finished(&self, job_id: JobId) {
        let interval = self.config.cancel_poll_interval();
        loop {
            tokio::time::sleep(interval).await;
            match self.store.load(job_id).await {
                Ok(Some(job)) if !job.status.is_terminal() => {}
                Ok(_) => return,
                Err(err) => {
                    debug!(target: "vigil::dispatch", job = %job_id, "status poll failed: {err}");
                }
            }
        }
    }

    /// An adapter gave up with `Cancelled` although nobody cancelled its job.
    /// The attempt is retried unless the job finished meanwhile.
    async fn self_cancelled(&self, task: &AgentTask, elapsed_ms: u64) -> DispatchStatus {
        match self.store.load(task.job_id).await {
            Ok(Some(job)) if !job.status.is_terminal() => {
                warn!(target: "vigil::dispatch", elapsed_ms, "agent cancelled its own run; retrying");
                DispatchStatus::Retry {
                    error: "agent cancelled its own run".into(),
                }
            }
            Ok(_) => DispatchStatus::Discard {
                reason: "job finalized".into(),
            },
            Err(err) => DispatchStatus::Retry {
                error: format!("agent cancelled its own run; job lookup failed: {err}"),
            },
        }
    }

    async fn run(&self, lease: &TaskLease) -> DispatchStatus {
        let task = &lease.task;

        let job = match self.store.load(task.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                return DispatchStatus::Discard {
                    reason: "job no longer exists".into(),
                };
            }
            Err(err) => {
                warn!(target: "vigil::dispatch", "job lookup failed: {err}");
                return DispatchStatus::Retry {
                    error: err.to_string(),
                };
            }
        };
        if job.status.is_terminal() {
            return DispatchStatus::Discard {
                reason: format!("job already {}", job.status),
            };
        }
        if job
            .agents
            .get(&task.agent)
            .is_some_and(|state| state.outcome.is_terminal())
        {
            return DispatchStatus::Discard {
                reason: "outcome already recorded".into(),
            };
        }

        let Some(adapter) = self.registry.get(&task.agent) else {
            warn!(target: "vigil::dispatch", "agent is not registered in this process");
            return DispatchStatus::Completed(AgentReport::failed(
                task,
                format!("agent {} is not registered", task.agent),
            ));
        };
        if !adapter.capabilities().applies_to(&task.target.languages) {
            return DispatchStatus::Completed(AgentReport::skipped(
                task,
                "no supported language in target",
            ));
        }

        let now = Utc::now();
        let timeout = self.timeout_for(task, adapter.as_ref());
        let agent_deadline = chrono::Duration::from_std(timeout)
            .map(|t| now + t)
            .unwrap_or(task.job_deadline);
        let deadline = agent_deadline.min(task.job_deadline);
        let Ok(remaining) = (deadline - now).to_std() else {
            return DispatchStatus::Completed(AgentReport::timed_out(
                task,
                "job deadline elapsed before the agent started",
            ));
        };

        let claim = self.cancellations.attempt(task.job_id);
        let ctx = self.context_for(task, adapter.as_ref(), deadline, claim.token());
        debug!(
            target: "vigil::dispatch",
            timeout_ms = remaining.as_millis() as u64,
            memory_mb = ?ctx.memory_mb,
            cpu_shares = ?ctx.cpu_shares,
            "starting agent"
        );

        let started = std::time::Instant::now();
        let attempt = tokio::select! {
            result = tokio::time::timeout(remaining, adapter.scan(&ctx, &task.target)) => {
                match result {
                    Ok(result) => Attempt::Finished(result),
                    Err(_) => Attempt::TimedOut(remaining),
                }
            }
            _ = ctx.cancel.cancelled() => Attempt::Cancelled,
            _ = self.job_finished(task.job_id) => Attempt::JobFinished,
        };
        let job_cancelled = ctx.cancel.is_cancelled();
        // Anything the adapter spawned in the background stops here too.
        ctx.cancel.cancel();
        drop(claim);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match attempt {
            Attempt::Finished(Ok(mut findings)) => {
                for finding in &mut findings {
                    finding.agent = task.agent.clone();
                }
                info!(
                    target: "vigil::dispatch",
                    findings = findings.len(),
                    elapsed_ms,
                    "agent succeeded"
                );
                DispatchStatus::Completed(AgentReport::succeeded(task, findings))
            }
            Attempt::Finished(Err(AgentError::Transient(error))) => {
                warn!(target: "vigil::dispatch", elapsed_ms, "transient agent failure: {error}");
                DispatchStatus::Retry { error }
            }
            Attempt::Finished(Err(AgentError::Fatal(error))) => {
                warn!(target: "vigil::dispatch", elapsed_ms, "agent failed: {error}");
                DispatchStatus::Completed(AgentReport::failed(task, error))
            }
            Attempt::Finished(Err(AgentError::Cancelled)) if !job_cancelled => {
                self.self_cancelled(task, elapsed_ms).await
            }
            Attempt::Finished(Err(AgentError::Cancelled)) | Attempt::Cancelled => {
                info!(target: "vigil::dispatch", elapsed_ms, "agent run abandoned; job cancelled");
                DispatchStatus::Discard {
                    reason: "job cancelled".into(),
                }
            }
            Attempt::JobFinished => {
                info!(target: "vigil::dispatch", elapsed_ms, "agent run abandoned; job finished elsewhere");
                // Siblings running here belong to the same terminal job.
                self.cancellations.cancel(task.job_id);
                DispatchStatus::Discard {
                    reason: "job finalized".into(),
                }
            }
            Attempt::TimedOut(limit) => {
                let error = format!("timed out after {}s", limit.as_secs());
                warn!(target: "vigil::dispatch", elapsed_ms, "{error}");
                if self.config.retry_timeouts && Utc::now() < task.job_deadline {
                    DispatchStatus::Retry { error }
                } else {
                    DispatchStatus::Completed(AgentReport::timed_out(task, error))
                }
            }
        }
    }
}

#[async_trait]
impl<S> TaskDispatcher for AgentTaskDispatcher<S>
where
    S: JobStore + 'static,
{
    async fn dispatch(&self, lease: &TaskLease) -> DispatchStatus {
        let task = &lease.task;
        let span = debug_span!(
            "agent_task",
            job = %task.job_id,
            agent = %task.agent,
            attempt = task.attempts.saturating_add(1),
            worker = %lease.worker_id,
        );
        let status = self.run(lease).instrument(span).await;
        if let DispatchStatus::Completed(report) = &status
            && report.outcome == TaskOutcome::Skipped
        {
            debug!(target: "vigil::dispatch", job = %task.job_id, agent = %task.agent, "agent skipped");
        }
        status
    }
}
