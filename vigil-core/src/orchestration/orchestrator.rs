use std::{
    any::{type_name, type_name_of_val},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    agent::AgentRegistry,
    cancellation::CancellationRegistry,
    config::OrchestratorConfig,
    dispatcher::AgentTaskDispatcher,
    events::{JobEvent, JobEventPayload, JobEventPublisher},
    queue::WorkQueue,
    runtime::{AgentPool, OutcomeSink},
    store::JobStore,
    task::{AgentReport, AgentTask},
};
use crate::{
    cache::{Fingerprint, ResultCache},
    consensus::ConsensusEngine,
    error::{Result, ScanError},
    types::{
        AgentName, AgentSet, AgentTaskState, FindingFilter, JobId, JobStatus,
        Page, ScanFilter, ScanJob, ScanList, ScanRequest, ScanResult,
        ScanSummary, TaskOutcome,
    },
};

/// Upper bound on compare-and-swap retries for one mutation.
const MAX_CAS_ATTEMPTS: usize = 16;

enum Mutation<T> {
    Apply(T),
    Skip(T),
}

struct Mutated<T> {
    job: ScanJob,
    value: T,
    written: bool,
}

/// Owns the scan job state machine: admission, outcome collection,
/// finalization with consensus, cancellation and deadlines.
///
/// Holds no job state of its own. Every change is a load, apply,
/// compare-and-swap cycle against the [`JobStore`], so several orchestrator
/// instances can share one store.
pub struct ScanOrchestrator<Q, S, C>
where
    Q: WorkQueue + 'static,
    S: JobStore + 'static,
    C: ResultCache + 'static,
{
    config: OrchestratorConfig,
    queue: Arc<Q>,
    store: Arc<S>,
    cache: Arc<C>,
    registry: Arc<AgentRegistry>,
    engine: ConsensusEngine,
    cancellations: CancellationRegistry,
    events: Arc<dyn JobEventPublisher>,
}

impl<Q, S, C> fmt::Debug for ScanOrchestrator<Q, S, C>
where
    Q: WorkQueue + 'static,
    S: JobStore + 'static,
    C: ResultCache + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("queue_type", &type_name::<Q>())
            .field("store_type", &type_name::<S>())
            .field("cache_type", &type_name::<C>())
            .field("events_type", &type_name_of_val(self.events.as_ref()))
            .field("registry", &self.registry)
            .field("engine", &self.engine)
            .field("active_jobs", &self.cancellations.active_jobs())
            .finish()
    }
}

impl<Q, S, C> ScanOrchestrator<Q, S, C>
where
    Q: WorkQueue + 'static,
    S: JobStore + 'static,
    C: ResultCache + 'static,
{
    pub fn new(
        config: OrchestratorConfig,
        queue: Arc<Q>,
        store: Arc<S>,
        cache: Arc<C>,
        registry: Arc<AgentRegistry>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Result<Self> {
        config.validate()?;
        let engine = ConsensusEngine::new(&config.consensus)?;
        Ok(Self {
            config,
            queue,
            store,
            cache,
            registry,
            engine,
            cancellations: CancellationRegistry::new(),
            events,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<Q> {
        Arc::clone(&self.queue)
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn cancellations(&self) -> CancellationRegistry {
        self.cancellations.clone()
    }

    /// Dispatcher sharing this orchestrator's store, registry and
    /// cancellation tokens.
    pub fn dispatcher(&self) -> AgentTaskDispatcher<S> {
        AgentTaskDispatcher::new(
            self.store(),
            self.registry(),
            self.cancellations(),
            self.config.dispatcher.clone(),
        )
    }

    /// Worker pool that reports outcomes back to this orchestrator.
    pub fn agent_pool(self: &Arc<Self>) -> AgentPool<Q> {
        let sink: Arc<dyn OutcomeSink> = Arc::clone(self) as Arc<dyn OutcomeSink>;
        AgentPool::new(
            self.config.clone(),
            self.queue(),
            Arc::new(self.dispatcher()),
            sink,
        )
    }

    /// Admits a scan and returns its id. The job may already be terminal on
    /// return (cache hit, nothing applicable).
    pub async fn submit_scan(&self, request: ScanRequest) -> Result<JobId> {
        request.validate()?;
        let target = request.target();

        let requested: AgentSet = match &request.agents {
            Some(names) => {
                let set: AgentSet =
                    names.iter().map(|n| AgentName::new(n.trim())).collect();
                if let Some(unknown) = set.iter().find(|a| !self.registry.contains(a)) {
                    return Err(ScanError::InvalidRequest(format!(
                        "unknown agent {unknown}"
                    )));
                }
                set
            }
            None => self.registry.agents_for_languages(&target.languages),
        };
        let applicable: AgentSet = requested
            .iter()
            .filter(|name| {
                self.registry
                    .get(name)
                    .is_some_and(|a| a.capabilities().applies_to(&target.languages))
            })
            .cloned()
            .collect();

        let fingerprint = Fingerprint::compute(&target, &requested);
        let deadline = chrono::Duration::from_std(self.config.jobs.deadline_for(target.mode))
            .map_err(|e| ScanError::Config(format!("job deadline out of range: {e}")))?;
        let mut job = ScanJob::new(
            target,
            request.priority,
            &requested,
            fingerprint,
            Utc::now() + deadline,
        );
        for (name, state) in job.agents.iter_mut() {
            if !applicable.contains(name) {
                *state = AgentTaskState::skipped("no supported language in target");
            }
        }
        let job_id = job.id;

        self.store.create(&job).await?;
        info!(
            target: "vigil::orchestrator",
            job = %job_id,
            repository = %job.target.repository.id,
            commit = %job.target.commit,
            agents = requested.len(),
            applicable = applicable.len(),
            priority = ?job.priority,
            "scan submitted"
        );
        self.publish(job_id, JobEventPayload::Submitted {
            agents: requested.clone(),
        })
        .await;

        if applicable.is_empty() {
            let done = self
                .mutate_job(job_id, |job| {
                    if job.status.is_terminal() {
                        return Ok(Mutation::Skip(()));
                    }
                    job.result = Some(ScanResult::default());
                    job.transition(JobStatus::Completed)?;
                    Ok(Mutation::Apply(()))
                })
                .await?;
            if done.written {
                self.after_finalize(&done.job).await;
            }
            return Ok(job_id);
        }

        if self.config.cache.enabled && self.serve_from_cache(job_id, &applicable).await? {
            return Ok(job_id);
        }

        let started = self
            .mutate_job(job_id, |job| {
                if job.status != JobStatus::Queued {
                    return Ok(Mutation::Skip(()));
                }
                job.transition(JobStatus::Running)?;
                Ok(Mutation::Apply(()))
            })
            .await?;
        if !started.written {
            debug!(target: "vigil::orchestrator", job = %job_id, status = %started.job.status, "job left Queued before dispatch");
            return Ok(job_id);
        }

        let job = started.job;
        let tasks: Vec<(AgentTask, _)> = applicable
            .iter()
            .map(|agent| {
                (
                    AgentTask::new(
                        job.id,
                        agent.clone(),
                        job.target.clone(),
                        job.priority,
                        job.deadline_at,
                    ),
                    job.priority,
                )
            })
            .collect();
        let count = tasks.len();

        if let Err(err) = self.queue.enqueue_many(tasks, Utc::now()).await {
            warn!(target: "vigil::orchestrator", job = %job_id, "failed to enqueue agent tasks: {err}");
            let reason = format!("could not enqueue agent tasks: {err}");
            let failed = self
                .mutate_job(job_id, |job| {
                    if job.status.is_terminal() {
                        return Ok(Mutation::Skip(()));
                    }
                    let now = Utc::now();
                    for state in job.agents.values_mut() {
                        if state.outcome == TaskOutcome::Pending {
                            state.outcome = TaskOutcome::Failed;
                            state.error = Some("not enqueued".into());
                            state.finished_at = Some(now);
                        }
                    }
                    job.failure_reason = Some(reason.clone());
                    job.transition(JobStatus::Failed)?;
                    Ok(Mutation::Apply(()))
                })
                .await;
            match failed {
                Ok(done) if done.written => self.after_finalize(&done.job).await,
                Ok(_) => {}
                Err(mark_err) => {
                    warn!(target: "vigil::orchestrator", job = %job_id, "could not mark job failed: {mark_err}");
                }
            }
            return Err(err);
        }

        self.publish(job_id, JobEventPayload::TasksEnqueued { count }).await;
        debug!(target: "vigil::orchestrator", job = %job_id, tasks = count, "agent tasks enqueued");
        Ok(job_id)
    }

    /// Completes `job_id` from the cache when a fresh entry covers
    /// `required`. Cache errors count as a miss.
    async fn serve_from_cache(&self, job_id: JobId, required: &AgentSet) -> Result<bool> {
        let Some(job) = self.store.load(job_id).await? else {
            return Err(ScanError::NotFound(format!("job {job_id}")));
        };
        let entry = match self.cache.lookup(&job.fingerprint, required).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(false),
            Err(err) => {
                warn!(target: "vigil::cache", job = %job_id, "cache lookup failed, treating as miss: {err}");
                return Ok(false);
            }
        };

        let stats = self.engine.summarize(&entry.findings);
        let done = self
            .mutate_job(job_id, |job| {
                if job.status != JobStatus::Queued {
                    return Ok(Mutation::Skip(()));
                }
                let now = Utc::now();
                for agent in required {
                    if let Some(state) = job.agents.get_mut(agent) {
                        *state = AgentTaskState {
                            outcome: TaskOutcome::Succeeded,
                            finished_at: Some(now),
                            ..AgentTaskState::default()
                        };
                    }
                }
                job.from_cache = true;
                job.result = Some(ScanResult {
                    findings: entry.findings.clone(),
                    stats: stats.clone(),
                    agents: entry.agents.clone(),
                });
                job.transition(JobStatus::Completed)?;
                Ok(Mutation::Apply(()))
            })
            .await?;

        if done.written {
            info!(
                target: "vigil::cache",
                job = %job_id,
                fingerprint = %done.job.fingerprint,
                findings = entry.findings.len(),
                "served scan from cache"
            );
            self.publish(job_id, JobEventPayload::CacheHit).await;
            self.after_finalize(&done.job).await;
        }
        Ok(true)
    }

    pub async fn get_status(&self, job_id: JobId) -> Result<ScanJob> {
        self.store
            .load(job_id)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("job {job_id}")))
    }

    /// Consensus output of a completed job; `None` while it is still running
    /// or when it did not complete.
    pub async fn results(&self, job_id: JobId) -> Result<Option<ScanResult>> {
        let job = self.get_status(job_id).await?;
        Ok(match job.status {
            JobStatus::Completed => job.result,
            _ => None,
        })
    }

    /// [`Self::results`] narrowed to the findings `filter` keeps.
    pub async fn filtered_results(
        &self,
        job_id: JobId,
        filter: &FindingFilter,
    ) -> Result<Option<ScanResult>> {
        Ok(self
            .results(job_id)
            .await?
            .map(|result| filter.apply(&result)))
    }

    /// Jobs matching `filter`, newest first, one page at a time.
    pub async fn list_scans(&self, filter: &ScanFilter, page: Page) -> Result<ScanList> {
        let mut list = ScanList::default();
        for job_id in self.store.list_jobs().await? {
            let Some(job) = self.store.load(job_id).await? else {
                continue;
            };
            if !filter.matches(&job) {
                continue;
            }
            if list.total >= page.offset && list.scans.len() < page.limit {
                list.scans.push(ScanSummary::from(&job));
            }
            list.total += 1;
        }
        Ok(list)
    }

    /// Stops a job before it finalizes. Pending agents are marked failed and
    /// their running attempts are signalled; no consensus is produced.
    pub async fn cancel_scan(&self, job_id: JobId) -> Result<ScanJob> {
        let done = self
            .mutate_job(job_id, |job| {
                if job.status.is_terminal() {
                    return Err(ScanError::InvalidTransition {
                        from: job.status,
                        to: JobStatus::Cancelled,
                    });
                }
                let now = Utc::now();
                for state in job.agents.values_mut() {
                    if state.outcome == TaskOutcome::Pending {
                        state.outcome = TaskOutcome::Failed;
                        state.error = Some("job cancelled".into());
                        state.finished_at = Some(now);
                    }
                }
                job.transition(JobStatus::Cancelled)?;
                Ok(Mutation::Apply(()))
            })
            .await?;

        info!(target: "vigil::orchestrator", job = %job_id, "scan cancelled");
        self.after_finalize(&done.job).await;
        Ok(done.job)
    }

    /// Applies one terminal agent outcome. Duplicates, reports for terminal
    /// jobs and reports for unknown jobs are ignored.
    pub async fn apply_outcome(&self, report: AgentReport) -> Result<()> {
        let job_id = report.job_id;
        if !report.outcome.is_terminal() {
            warn!(target: "vigil::orchestrator", job = %job_id, agent = %report.agent, "ignoring non-terminal report");
            return Ok(());
        }

        let applied = self
            .mutate_job(job_id, |job| {
                if job.status.is_terminal() {
                    return Ok(Mutation::Skip(false));
                }
                let Some(state) = job.agents.get_mut(&report.agent) else {
                    warn!(target: "vigil::orchestrator", job = %job_id, agent = %report.agent, "report for an agent the job never requested");
                    return Ok(Mutation::Skip(false));
                };
                if state.outcome.is_terminal() {
                    return Ok(Mutation::Skip(false));
                }
                *state = AgentTaskState {
                    outcome: report.outcome,
                    attempts: report.attempts,
                    findings: report.findings.clone(),
                    error: report.error.clone(),
                    finished_at: Some(Utc::now()),
                };
                let finalized = job.all_agents_terminal();
                if finalized {
                    self.finalize_in_place(job)?;
                }
                Ok(Mutation::Apply(finalized))
            })
            .await;

        let done = match applied {
            Ok(done) => done,
            Err(ScanError::NotFound(_)) => {
                debug!(target: "vigil::orchestrator", job = %job_id, "report for unknown job dropped");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if !done.written {
            debug!(target: "vigil::orchestrator", job = %job_id, agent = %report.agent, "duplicate or late report ignored");
            return Ok(());
        }

        info!(
            target: "vigil::orchestrator",
            job = %job_id,
            agent = %report.agent,
            outcome = %report.outcome,
            attempts = report.attempts,
            findings = report.findings.len(),
            "agent outcome recorded"
        );
        self.publish(job_id, JobEventPayload::AgentReported {
            agent: report.agent.clone(),
            outcome: report.outcome,
            attempts: report.attempts,
        })
        .await;
        if done.value {
            self.after_finalize(&done.job).await;
        }
        Ok(())
    }

    /// Finalizes every active job whose deadline has passed. Returns how many
    /// jobs this call finalized.
    pub async fn sweep_deadlines(&self) -> Result<usize> {
        let mut finalized = 0;
        for job_id in self.store.list_active().await? {
            let Some(job) = self.store.load(job_id).await? else {
                continue;
            };
            if job.status.is_terminal() || Utc::now() < job.deadline_at {
                continue;
            }

            let done = self
                .mutate_job(job_id, |job| {
                    let now = Utc::now();
                    if job.status.is_terminal() || now < job.deadline_at {
                        return Ok(Mutation::Skip(()));
                    }
                    let was_queued = job.status == JobStatus::Queued;
                    for state in job.agents.values_mut() {
                        if state.outcome == TaskOutcome::Pending {
                            state.outcome = TaskOutcome::TimedOut;
                            state.error = Some("job deadline elapsed".into());
                            state.finished_at = Some(now);
                        }
                    }
                    if was_queued {
                        job.failure_reason =
                            Some("admission did not complete before the deadline".into());
                        job.transition(JobStatus::Failed)?;
                    } else {
                        self.finalize_in_place(job)?;
                    }
                    Ok(Mutation::Apply(()))
                })
                .await;

            match done {
                Ok(done) if done.written => {
                    warn!(
                        target: "vigil::orchestrator",
                        job = %job_id,
                        status = %done.job.status,
                        "job deadline elapsed; finalized with partial results"
                    );
                    self.after_finalize(&done.job).await;
                    finalized += 1;
                }
                Ok(_) => {}
                Err(ScanError::NotFound(_)) => {}
                Err(err) => {
                    warn!(target: "vigil::orchestrator", job = %job_id, "deadline sweep failed: {err}")
                }
            }
        }
        Ok(finalized)
    }

    /// Background task running [`Self::sweep_deadlines`] every
    /// `jobs.sweep_interval_ms` until `shutdown` fires.
    pub fn spawn_deadline_sweeper(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let interval = self.config.jobs.sweep_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(target: "vigil::orchestrator", "deadline sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match orchestrator.sweep_deadlines().await {
                            Ok(0) => {}
                            Ok(n) => debug!(target: "vigil::orchestrator", finalized = n, "deadline sweep"),
                            Err(err) => warn!(target: "vigil::orchestrator", "deadline sweep error: {err}"),
                        }
                    }
                }
            }
        })
    }

    /// Decides the terminal status of a job whose agents are all terminal.
    fn finalize_in_place(&self, job: &mut ScanJob) -> Result<()> {
        let succeeded = job.agents_with(TaskOutcome::Succeeded);
        if !succeeded.is_empty() {
            let report = self.engine.analyze(&job.collected_findings());
            job.result = Some(ScanResult {
                findings: report.findings,
                stats: report.stats,
                agents: succeeded,
            });
            job.transition(JobStatus::Completed)
        } else if job
            .agents
            .values()
            .all(|s| s.outcome == TaskOutcome::Skipped)
        {
            job.result = Some(ScanResult::default());
            job.transition(JobStatus::Completed)
        } else {
            job.failure_reason = Some(job.failure_summary());
            job.transition(JobStatus::Failed)
        }
    }

    /// Side effects of a job that was just written in a terminal status.
    async fn after_finalize(&self, job: &ScanJob) {
        self.cancellations.cancel(job.id);

        let findings = job.result.as_ref().map_or(0, |r| r.findings.len());
        if job.status == JobStatus::Completed
            && !job.from_cache
            && self.config.cache.enabled
            && let Some(result) = &job.result
            && !result.agents.is_empty()
        {
            if let Err(err) = self
                .cache
                .store(
                    &job.fingerprint,
                    &result.agents,
                    &result.findings,
                    self.config.cache.ttl(),
                )
                .await
            {
                warn!(target: "vigil::cache", job = %job.id, "failed to cache result: {err}");
            }
        }

        info!(
            target: "vigil::orchestrator",
            job = %job.id,
            status = %job.status,
            findings,
            from_cache = job.from_cache,
            reason = job.failure_reason.as_deref().unwrap_or(""),
            "job finalized"
        );
        self.publish(job.id, JobEventPayload::Finalized {
            status: job.status,
            findings,
        })
        .await;
    }

    async fn publish(&self, job_id: JobId, payload: JobEventPayload) {
        if let Err(err) = self.events.publish(JobEvent::new(job_id, payload)).await {
            debug!(target: "vigil::orchestrator", job = %job_id, "event publish failed: {err}");
        }
    }

    /// Load, apply, compare-and-swap; retried on revision conflicts. `apply`
    /// may run several times and must not have side effects.
    async fn mutate_job<F, T>(&self, job_id: JobId, mut apply: F) -> Result<Mutated<T>>
    where
        F: FnMut(&mut ScanJob) -> Result<Mutation<T>>,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let mut job = self
                .store
                .load(job_id)
                .await?
                .ok_or_else(|| ScanError::NotFound(format!("job {job_id}")))?;
            let expected = job.revision;

            match apply(&mut job)? {
                Mutation::Skip(value) => {
                    return Ok(Mutated {
                        job,
                        value,
                        written: false,
                    });
                }
                Mutation::Apply(value) => {
                    job.revision = expected + 1;
                    if self.store.compare_and_swap(&job, expected).await? {
                        return Ok(Mutated {
                            job,
                            value,
                            written: true,
                        });
                    }
                    debug!(target: "vigil::orchestrator", job = %job_id, attempt, "revision conflict, retrying");
                }
            }
        }
        Err(ScanError::Internal(format!(
            "job {job_id}: gave up after {MAX_CAS_ATTEMPTS} conflicting updates"
        )))
    }
}

#[async_trait]
impl<Q, S, C> OutcomeSink for ScanOrchestrator<Q, S, C>
where
    Q: WorkQueue + 'static,
    S: JobStore + 'static,
    C: ResultCache + 'static,
{
    async fn record_outcome(&self, report: AgentReport) -> Result<()> {
        self.apply_outcome(report).await
    }
}
