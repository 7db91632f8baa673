use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use vigil_core::{
    cache::InMemoryResultCache,
    error::ScanError,
    orchestration::{
        AgentAdapter, AgentCapabilities, AgentError, AgentOverride, AgentPool,
        AgentRegistry, AgentReport, AgentTask, InMemoryJobStore,
        InMemoryWorkQueue, InProcJobEventBus, JobEventPayload,
        OrchestratorConfig, ScanContext, ScanOrchestrator, WorkQueue,
    },
    types::{
        AgentName, FindingFilter, JobId, JobStatus, LineRange, Page, RawFinding,
        ScanFilter, ScanJob, ScanRequest, ScanTarget, Severity, TaskOutcome,
    },
};

type Orchestrator =
    ScanOrchestrator<InMemoryWorkQueue, InMemoryJobStore, InMemoryResultCache>;

#[derive(Clone, Copy)]
enum Behaviour {
    Report { line: u32, confidence: f64 },
    FailOnceThenReport { line: u32, confidence: f64 },
    Fatal,
    Hang,
    GiveUp,
}

struct FakeAgent {
    name: AgentName,
    caps: AgentCapabilities,
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl FakeAgent {
    fn new(name: &str, behaviour: Behaviour) -> Arc<Self> {
        Self::with_languages(name, &[], behaviour)
    }

    fn with_languages(name: &str, languages: &[&str], behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            name: AgentName::from(name),
            caps: AgentCapabilities::for_languages(languages),
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn finding(&self, line: u32, confidence: f64) -> RawFinding {
        RawFinding {
            agent: self.name.clone(),
            rule_id: format!("{}-sqli", self.name),
            severity: Severity::High,
            file: "app/db.go".into(),
            location: LineRange::line(line),
            title: format!("SQL built from input ({})", self.name),
            description: String::new(),
            confidence,
            fix: None,
            category_hint: Some("sql-injection".into()),
            references: Vec::new(),
        }
    }
}

#[async_trait]
impl AgentAdapter for FakeAgent {
    fn name(&self) -> &AgentName {
        &self.name
    }

    fn capabilities(&self) -> &AgentCapabilities {
        &self.caps
    }

    async fn scan(
        &self,
        ctx: &ScanContext,
        _target: &ScanTarget,
    ) -> Result<Vec<RawFinding>, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Report { line, confidence } => Ok(vec![self.finding(line, confidence)]),
            Behaviour::FailOnceThenReport { line, confidence } => {
                if call == 0 {
                    Err(AgentError::Transient("registry unavailable".into()))
                } else {
                    Ok(vec![self.finding(line, confidence)])
                }
            }
            Behaviour::Fatal => Err(AgentError::Fatal(format!("{} crashed", self.name))),
            Behaviour::Hang => {
                ctx.cancel.cancelled().await;
                Err(AgentError::Cancelled)
            }
            Behaviour::GiveUp => Err(AgentError::Cancelled),
        }
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<InMemoryWorkQueue>,
    bus: Arc<InProcJobEventBus>,
    pool: AgentPool<InMemoryWorkQueue>,
}

fn config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.queue.poll_interval_ms = 5;
    config.queue.housekeeper_interval_ms = 20;
    config.dispatcher.workers = 3;
    config.dispatcher.cancel_poll_interval_ms = 20;
    config.retry.backoff_base_ms = 10;
    config.retry.backoff_max_ms = 50;
    config.retry.jitter_min_ms = 0;
    config.consensus.agent_weights =
        [(AgentName::from("x"), 0.9), (AgentName::from("y"), 0.7)].into();
    config
}

fn harness(agents: Vec<Arc<FakeAgent>>, config: OrchestratorConfig) -> Harness {
    harness_with_visibility(agents, config, None)
}

fn harness_with_visibility(
    agents: Vec<Arc<FakeAgent>>,
    config: OrchestratorConfig,
    visibility: Option<Duration>,
) -> Harness {
    let mut registry = AgentRegistry::builder();
    for agent in agents {
        registry = registry.register(agent).expect("register agent");
    }
    let queue = Arc::new(InMemoryWorkQueue::new(
        config.retry,
        visibility.unwrap_or_else(|| config.queue.visibility_timeout()),
    ));
    let bus = Arc::new(InProcJobEventBus::new(256));
    let orchestrator = Arc::new(
        ScanOrchestrator::new(
            config,
            queue.clone(),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryResultCache::new()),
            Arc::new(registry.build()),
            bus.clone(),
        )
        .expect("valid orchestrator config"),
    );
    let pool = orchestrator.agent_pool();
    Harness {
        orchestrator,
        queue,
        bus,
        pool,
    }
}

fn request() -> ScanRequest {
    ScanRequest::new("acme/payments", "9f2c1e7")
}

async fn wait_for_terminal(orchestrator: &Orchestrator, job_id: JobId) -> ScanJob {
    for _ in 0..500 {
        let job = orchestrator.get_status(job_id).await.expect("job exists");
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not finish");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn agreeing_agents_merge_into_one_scored_finding() {
    let x = FakeAgent::new("x", Behaviour::Report { line: 42, confidence: 0.8 });
    let y = FakeAgent::new("y", Behaviour::Report { line: 43, confidence: 0.6 });
    let h = harness(vec![x, y], config());
    h.pool.start().await.expect("pool starts");

    let job_id = h.orchestrator.submit_scan(request()).await.expect("submit");
    let job = wait_for_terminal(&h.orchestrator, job_id).await;
    h.pool.shutdown().await.expect("pool stops");

    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.as_ref().expect("completed job has a result");
    assert_eq!(result.findings.len(), 1);
    let finding = &result.findings[0];
    assert!((finding.score - 0.8376).abs() < 1e-9, "score {}", finding.score);
    assert_eq!(finding.contributing_agents.len(), 2);
    assert_eq!(finding.category.as_str(), "sql-injection");
    assert_eq!(job.progress(), 1.0);
    assert_eq!(h.orchestrator.cancellations().active_jobs(), 0);
}

#[tokio::test]
async fn agent_cancelling_itself_does_not_stall_the_job() {
    let x = FakeAgent::new("x", Behaviour::GiveUp);
    let y = FakeAgent::new("y", Behaviour::Report { line: 20, confidence: 0.6 });
    let h = harness(vec![x.clone(), y.clone()], config());
    h.pool.start().await.expect("pool starts");

    let job_id = h.orchestrator.submit_scan(request()).await.expect("submit");
    let job = wait_for_terminal(&h.orchestrator, job_id).await;
    h.pool.shutdown().await.expect("pool stops");

    assert_eq!(job.status, JobStatus::Completed);
    let x_state = &job.agents[&AgentName::from("x")];
    assert_eq!(x_state.outcome, TaskOutcome::Failed);
    assert_eq!(x_state.attempts, 3);
    assert_eq!(x.calls(), 3);
    assert_eq!(job.agents[&AgentName::from("y")].outcome, TaskOutcome::Succeeded);
    assert_eq!(y.calls(), 1);
    assert_eq!(job.result.expect("result").findings.len(), 1);
    assert_eq!(h.orchestrator.cancellations().active_jobs(), 0);
}

#[tokio::test]
async fn timed_out_agent_does_not_block_partial_consensus() {
    let x = FakeAgent::new("x", Behaviour::Report { line: 10, confidence: 0.8 });
    let y = FakeAgent::new("y", Behaviour::Hang);
    let mut config = config();
    config.dispatcher.agents.insert(
        AgentName::from("y"),
        AgentOverride {
            timeout_secs: Some(1),
            ..AgentOverride::default()
        },
    );
    let h = harness(vec![x, y], config);
    h.pool.start().await.expect("pool starts");

    let job_id = h.orchestrator.submit_scan(request()).await.expect("submit");
    let job = wait_for_terminal(&h.orchestrator, job_id).await;
    h.pool.shutdown().await.expect("pool stops");

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.agents[&AgentName::from("x")].outcome, TaskOutcome::Succeeded);
    assert_eq!(job.agents[&AgentName::from("y")].outcome, TaskOutcome::TimedOut);

    let result = job.result.expect("result");
    assert_eq!(result.findings.len(), 1);
    assert!((result.findings[0].score - 0.72).abs() < 1e-9);
    assert!(result.agents.contains("x"));
    assert!(!result.agents.contains("y"));
}

#[tokio::test]
async fn all_agents_failing_fails_the_job_with_every_reason() {
    let x = FakeAgent::new("x", Behaviour::Fatal);
    let y = FakeAgent::new("y", Behaviour::Fatal);
    let h = harness(vec![x, y], config());
    h.pool.start().await.expect("pool starts");

    let job_id = h.orchestrator.submit_scan(request()).await.expect("submit");
    let job = wait_for_terminal(&h.orchestrator, job_id).await;
    h.pool.shutdown().await.expect("pool stops");

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.result.is_none());
    let reason = job.failure_reason.expect("failure reason");
    assert!(reason.starts_with("all agents failed"), "{reason}");
    assert!(reason.contains("x: failed (x crashed)"), "{reason}");
    assert!(reason.contains("y: failed (y crashed)"), "{reason}");
}

#[tokio::test]
async fn transient_failure_is_retried_with_backoff() {
    let x = FakeAgent::new("x", Behaviour::FailOnceThenReport { line: 5, confidence: 1.0 });
    let h = harness(vec![x.clone()], config());
    h.pool.start().await.expect("pool starts");

    let job_id = h.orchestrator.submit_scan(request()).await.expect("submit");
    let job = wait_for_terminal(&h.orchestrator, job_id).await;
    h.pool.shutdown().await.expect("pool stops");

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(x.calls(), 2);
    assert_eq!(job.agents[&AgentName::from("x")].attempts, 2);
}

#[tokio::test]
async fn cancel_stops_pending_agents_and_skips_consensus() {
    let a = FakeAgent::new("a", Behaviour::Report { line: 1, confidence: 0.9 });
    let b = FakeAgent::new("b", Behaviour::Hang);
    let c = FakeAgent::new("c", Behaviour::Hang);
    let h = harness(vec![a, b.clone(), c.clone()], config());
    let mut events = h.bus.subscribe();
    h.pool.start().await.expect("pool starts");

    let job_id = h.orchestrator.submit_scan(request()).await.expect("submit");
    wait_until(|| b.calls() == 1 && c.calls() == 1).await;
    for _ in 0..500 {
        let job = h.orchestrator.get_status(job_id).await.expect("job");
        if job.agents[&AgentName::from("a")].outcome.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let job = h.orchestrator.cancel_scan(job_id).await.expect("cancel");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result.is_none());
    assert_eq!(job.agents[&AgentName::from("a")].outcome, TaskOutcome::Succeeded);
    for name in ["b", "c"] {
        let state = &job.agents[&AgentName::from(name)];
        assert_eq!(state.outcome, TaskOutcome::Failed);
        assert_eq!(state.error.as_deref(), Some("job cancelled"));
    }

    assert!(h.orchestrator.results(job_id).await.expect("results").is_none());

    let again = h.orchestrator.cancel_scan(job_id).await;
    assert!(matches!(again, Err(ScanError::InvalidTransition { .. })));

    let mut saw_cancelled = false;
    while let Ok(event) = events.try_recv() {
        if let JobEventPayload::Finalized { status, .. } = event.payload {
            saw_cancelled = status == JobStatus::Cancelled;
        }
    }
    assert!(saw_cancelled);

    // The hung attempts observe the token and are discarded.
    for _ in 0..500 {
        let snapshot = h.queue.snapshot().await.expect("snapshot");
        if snapshot.leased + snapshot.total_ready() + snapshot.delayed == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snapshot = h.queue.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.leased + snapshot.total_ready() + snapshot.delayed, 0);
    assert_eq!(snapshot.dead_letter, 0);
    assert_eq!(h.orchestrator.cancellations().active_jobs(), 0);
    h.pool.shutdown().await.expect("pool stops");
}

#[tokio::test]
async fn no_applicable_agents_completes_immediately() {
    let gosec = FakeAgent::with_languages("gosec", &["go"], Behaviour::Fatal);
    let h = harness(vec![gosec.clone()], config());

    let mut request = request();
    request.languages = vec!["python".into()];
    let job_id = h.orchestrator.submit_scan(request).await.expect("submit");

    let job = h.orchestrator.get_status(job_id).await.expect("job");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.agents.is_empty());
    assert!(job.result.expect("result").findings.is_empty());
    assert_eq!(h.queue.snapshot().await.expect("snapshot").total_ready(), 0);
    assert_eq!(gosec.calls(), 0);
}

#[tokio::test]
async fn one_task_per_applicable_agent() {
    let gosec = FakeAgent::with_languages("gosec", &["go"], Behaviour::Fatal);
    let bandit = FakeAgent::with_languages("bandit", &["python"], Behaviour::Fatal);
    let gitleaks = FakeAgent::new("gitleaks", Behaviour::Fatal);
    let h = harness(vec![gosec, bandit, gitleaks], config());

    let mut request = request();
    request.languages = vec!["Go".into()];
    request.agents = Some(vec!["gosec".into(), "bandit".into(), "gitleaks".into()]);
    let job_id = h.orchestrator.submit_scan(request).await.expect("submit");

    let job = h.orchestrator.get_status(job_id).await.expect("job");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.agents.len(), 3);
    assert_eq!(job.agents[&AgentName::from("bandit")].outcome, TaskOutcome::Skipped);
    assert_eq!(h.queue.snapshot().await.expect("snapshot").total_ready(), 2);
}

#[tokio::test]
async fn unknown_explicit_agent_is_rejected() {
    let h = harness(vec![FakeAgent::new("x", Behaviour::Fatal)], config());
    let mut request = request();
    request.agents = Some(vec!["x".into(), "nope".into()]);
    let err = h.orchestrator.submit_scan(request).await.expect_err("rejected");
    assert!(matches!(err, ScanError::InvalidRequest(_)));

    let err = h
        .orchestrator
        .submit_scan(ScanRequest::new("acme/payments", " "))
        .await
        .expect_err("commit required");
    assert!(matches!(err, ScanError::InvalidRequest(_)));
}

#[tokio::test]
async fn identical_rescan_is_served_from_cache() {
    let x = FakeAgent::new("x", Behaviour::Report { line: 7, confidence: 0.5 });
    let y = FakeAgent::new("y", Behaviour::Report { line: 7, confidence: 0.5 });
    let z = FakeAgent::new("z", Behaviour::Report { line: 90, confidence: 0.5 });
    let h = harness(vec![x.clone(), y.clone(), z.clone()], config());
    h.pool.start().await.expect("pool starts");

    let mut first = request();
    first.agents = Some(vec!["x".into(), "y".into()]);
    let first_id = h.orchestrator.submit_scan(first.clone()).await.expect("submit");
    let first_job = wait_for_terminal(&h.orchestrator, first_id).await;
    assert!(!first_job.from_cache);

    let second_id = h.orchestrator.submit_scan(first).await.expect("resubmit");
    let second_job = h.orchestrator.get_status(second_id).await.expect("job");
    assert_eq!(second_job.status, JobStatus::Completed);
    assert!(second_job.from_cache);
    assert_eq!(
        second_job.result.expect("cached result").findings,
        first_job.result.expect("result").findings
    );
    assert_eq!(x.calls(), 1);
    assert_eq!(y.calls(), 1);

    // A wider agent set cannot be answered by a narrower cached run.
    let mut wider = request();
    wider.agents = Some(vec!["x".into(), "y".into(), "z".into()]);
    let wider_id = h.orchestrator.submit_scan(wider).await.expect("submit");
    let wider_job = wait_for_terminal(&h.orchestrator, wider_id).await;
    h.pool.shutdown().await.expect("pool stops");

    assert!(!wider_job.from_cache);
    assert_eq!(z.calls(), 1);
    assert_eq!(x.calls(), 2);
}

#[tokio::test]
async fn crashed_worker_lease_is_reclaimed_and_rerun() {
    let x = FakeAgent::new("x", Behaviour::Report { line: 3, confidence: 0.9 });
    let h = harness_with_visibility(vec![x.clone()], config(), Some(Duration::from_millis(50)));

    let job_id = h.orchestrator.submit_scan(request()).await.expect("submit");
    // A worker leases the task and disappears without ack or nack.
    let stolen = h.queue.lease("crashed-worker", 1).await.expect("lease");
    assert_eq!(stolen.len(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    h.pool.start().await.expect("pool starts");
    let job = wait_for_terminal(&h.orchestrator, job_id).await;
    h.pool.shutdown().await.expect("pool stops");

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(x.calls(), 1);
    assert_eq!(job.agents[&AgentName::from("x")].attempts, 2);
    assert!(h.queue.ack(&stolen[0].receipt()).await.is_err());
}

#[tokio::test]
async fn deadline_sweep_finalizes_with_partial_results() {
    let x = FakeAgent::new("x", Behaviour::Report { line: 3, confidence: 0.9 });
    let y = FakeAgent::new("y", Behaviour::Hang);
    let mut config = config();
    config.jobs.full_deadline_secs = 1;
    let h = harness(vec![x.clone(), y], config);

    let job_id = h.orchestrator.submit_scan(request()).await.expect("submit");
    let job = h.orchestrator.get_status(job_id).await.expect("job");

    // Only x reports before the deadline.
    let task = AgentTask::new(
        job.id,
        AgentName::from("x"),
        job.target.clone(),
        job.priority,
        job.deadline_at,
    );
    let report = AgentReport::succeeded(&task, vec![x.finding(3, 0.9)]);
    h.orchestrator.apply_outcome(report.clone()).await.expect("record");
    // Duplicate delivery is a no-op.
    h.orchestrator.apply_outcome(report).await.expect("record duplicate");
    let before = h.orchestrator.get_status(job_id).await.expect("job");
    assert_eq!(before.status, JobStatus::Running);
    assert_eq!(before.revision, 2);

    assert_eq!(h.orchestrator.sweep_deadlines().await.expect("sweep"), 0);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(h.orchestrator.sweep_deadlines().await.expect("sweep"), 1);

    let job = h.orchestrator.get_status(job_id).await.expect("job");
    assert_eq!(job.status, JobStatus::Completed);
    let y = &job.agents[&AgentName::from("y")];
    assert_eq!(y.outcome, TaskOutcome::TimedOut);
    assert_eq!(y.error.as_deref(), Some("job deadline elapsed"));
    assert_eq!(job.result.expect("result").findings.len(), 1);
}

#[tokio::test]
async fn lifecycle_events_are_published_in_order() {
    let x = FakeAgent::new("x", Behaviour::Report { line: 3, confidence: 0.9 });
    let h = harness(vec![x], config());
    let mut events = h.bus.subscribe();
    h.pool.start().await.expect("pool starts");

    let job_id = h.orchestrator.submit_scan(request()).await.expect("submit");
    let mut kinds = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("bus open");
        assert_eq!(event.job_id, job_id);
        let last = event.is_final();
        kinds.push(match event.payload {
            JobEventPayload::Submitted { .. } => "submitted",
            JobEventPayload::CacheHit => "cache_hit",
            JobEventPayload::TasksEnqueued { .. } => "enqueued",
            JobEventPayload::AgentReported { .. } => "reported",
            JobEventPayload::Finalized { .. } => "finalized",
        });
        if last {
            break;
        }
    }
    h.pool.shutdown().await.expect("pool stops");

    assert_eq!(kinds.first(), Some(&"submitted"));
    assert_eq!(kinds.last(), Some(&"finalized"));
    assert!(kinds.contains(&"reported"));
}

#[tokio::test]
async fn scans_are_listed_newest_first_and_results_filter() {
    let x = FakeAgent::new("x", Behaviour::Report { line: 12, confidence: 0.9 });
    let h = harness(vec![x], config());
    h.pool.start().await.expect("pool starts");

    let done_id = h.orchestrator.submit_scan(request()).await.expect("submit");
    wait_for_terminal(&h.orchestrator, done_id).await;
    h.pool.shutdown().await.expect("pool stops");

    let other_id = h
        .orchestrator
        .submit_scan(ScanRequest::new("acme/web", "1a2b3c"))
        .await
        .expect("submit");
    let third_id = h
        .orchestrator
        .submit_scan(ScanRequest::new("acme/payments", "77aa01"))
        .await
        .expect("submit");

    let all = h
        .orchestrator
        .list_scans(&ScanFilter::default(), Page::default())
        .await
        .expect("list");
    assert_eq!(all.total, 3);
    let ids: Vec<JobId> = all.scans.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![third_id, other_id, done_id]);

    let payments = ScanFilter {
        repository: Some("acme/payments".into()),
        ..ScanFilter::default()
    };
    let page = h
        .orchestrator
        .list_scans(&payments, Page { limit: 1, offset: 1 })
        .await
        .expect("list");
    assert_eq!(page.total, 2);
    assert_eq!(page.scans.len(), 1);
    assert_eq!(page.scans[0].id, done_id);
    assert_eq!(page.scans[0].status, JobStatus::Completed);
    assert_eq!(page.scans[0].findings, 1);

    let completed = ScanFilter {
        status: Some(JobStatus::Completed),
        ..ScanFilter::default()
    };
    let only_done = h
        .orchestrator
        .list_scans(&completed, Page::default())
        .await
        .expect("list");
    assert_eq!(only_done.total, 1);

    let high = FindingFilter {
        min_severity: Some(Severity::High),
        ..FindingFilter::default()
    };
    let critical = FindingFilter {
        min_severity: Some(Severity::Critical),
        ..FindingFilter::default()
    };
    let kept = h
        .orchestrator
        .filtered_results(done_id, &high)
        .await
        .expect("results")
        .expect("completed");
    assert_eq!(kept.findings.len(), 1);
    let dropped = h
        .orchestrator
        .filtered_results(done_id, &critical)
        .await
        .expect("results")
        .expect("completed");
    assert!(dropped.findings.is_empty());
    assert!(
        h.orchestrator
            .filtered_results(other_id, &high)
            .await
            .expect("results")
            .is_none()
    );
}
