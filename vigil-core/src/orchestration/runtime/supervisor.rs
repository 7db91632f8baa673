use std::{
    any::{type_name, type_name_of_val},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, ScanError},
    orchestration::{
        backoff::RetryPolicy,
        config::OrchestratorConfig,
        dispatcher::{DispatchStatus, TaskDispatcher},
        lease::{NackOutcome, ReclaimedTask, TaskLease},
        queue::WorkQueue,
        task::AgentReport,
    },
};

/// Receiver of terminal agent outcomes. Must tolerate duplicates: a report
/// can be delivered again if the worker dies between recording and ack.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn record_outcome(&self, report: AgentReport) -> Result<()>;
}

/// Fixed-size pool of workers draining the work queue, plus the housekeeper
/// that reclaims expired leases. Each worker runs at most one agent task at a
/// time.
pub struct AgentPool<Q>
where
    Q: WorkQueue + 'static,
{
    config: OrchestratorConfig,
    queue: Arc<Q>,
    dispatcher: Arc<dyn TaskDispatcher>,
    sink: Arc<dyn OutcomeSink>,
    retry: RetryPolicy,
    worker_group: String,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<Q> fmt::Debug for AgentPool<Q>
where
    Q: WorkQueue + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("AgentPool")
            .field("queue_type", &type_name::<Q>())
            .field("dispatcher_type", &type_name_of_val(self.dispatcher.as_ref()))
            .field("sink_type", &type_name_of_val(self.sink.as_ref()))
            .field("workers", &self.config.dispatcher.workers)
            .field("worker_group", &self.worker_group)
            .field("worker_handle_count", &worker_handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<Q> AgentPool<Q>
where
    Q: WorkQueue + 'static,
{
    pub fn new(
        config: OrchestratorConfig,
        queue: Arc<Q>,
        dispatcher: Arc<dyn TaskDispatcher>,
        sink: Arc<dyn OutcomeSink>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry);
        Self {
            config,
            queue,
            dispatcher,
            sink,
            retry,
            worker_group: format!("vigil-{}", std::process::id()),
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> Arc<Q> {
        Arc::clone(&self.queue)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn start(&self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(ScanError::Internal("agent pool already shut down".into()));
        }
        let workers = self.config.dispatcher.workers.max(1);
        let mut handles = self.worker_handles.lock().await;
        if !handles.is_empty() {
            return Err(ScanError::Internal("agent pool already started".into()));
        }

        for i in 0..workers {
            let worker = Worker {
                worker_id: format!("{}-w{}", self.worker_group, i),
                queue: Arc::clone(&self.queue),
                dispatcher: Arc::clone(&self.dispatcher),
                sink: Arc::clone(&self.sink),
                retry: self.retry,
                poll_interval: self.config.queue.poll_interval(),
                shutdown: self.shutdown_token.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        handles.push(self.spawn_housekeeper());

        info!(target: "vigil::pool", workers, group = %self.worker_group, "agent pool started");
        Ok(())
    }

    fn spawn_housekeeper(&self) -> tokio::task::JoinHandle<()> {
        let q = self.queue();
        let sink = Arc::clone(&self.sink);
        let interval = self.config.queue.housekeeper_interval();
        let retention = DeadLetterRetention::from(&self.config);
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(target: "vigil::pool", "housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match q.reclaim_expired().await {
                            Ok(reclaimed) => report_dead_lettered(sink.as_ref(), reclaimed).await,
                            Err(err) => warn!(target: "vigil::pool", "housekeeper reclaim error: {err}"),
                        }
                        if let Err(err) = retention.purge(q.as_ref()).await {
                            warn!(target: "vigil::pool", "housekeeper dead-letter purge error: {err}");
                        }
                    }
                }
            }
        })
    }

    /// Runs one housekeeping pass immediately. Returns how many leases were
    /// reclaimed.
    pub async fn reclaim_now(&self) -> Result<usize> {
        let reclaimed = self.queue.reclaim_expired().await?;
        let count = reclaimed.len();
        report_dead_lettered(self.sink.as_ref(), reclaimed).await;
        DeadLetterRetention::from(&self.config)
            .purge(self.queue.as_ref())
            .await?;
        Ok(count)
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "vigil::pool", "initiating graceful shutdown of agent pool");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(target: "vigil::pool", "worker task failed: {:?}", e),
                Err(_) => warn!(target: "vigil::pool", "worker task timed out during shutdown"),
            }
        }

        info!(target: "vigil::pool", "agent pool shutdown complete");
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct DeadLetterRetention {
    max_age: chrono::Duration,
    max_kept: usize,
}

impl From<&OrchestratorConfig> for DeadLetterRetention {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_age: chrono::Duration::from_std(config.queue.dead_letter_retention())
                .unwrap_or(chrono::Duration::MAX),
            max_kept: config.queue.dead_letter_max,
        }
    }
}

impl DeadLetterRetention {
    async fn purge<Q: WorkQueue + ?Sized>(&self, queue: &Q) -> Result<usize> {
        let cutoff = chrono::Utc::now()
            .checked_sub_signed(self.max_age)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let removed = queue.purge_dead_letters(cutoff, self.max_kept).await?;
        if removed > 0 {
            info!(target: "vigil::pool", removed, "purged dead letters");
        }
        Ok(removed)
    }
}

async fn report_dead_lettered(sink: &dyn OutcomeSink, reclaimed: Vec<ReclaimedTask>) {
    for ReclaimedTask { task, dead_lettered } in reclaimed {
        if !dead_lettered {
            continue;
        }
        let mut report = AgentReport::failed(
            &task,
            format!("lease expired; retries exhausted after {} attempts", task.attempts),
        );
        report.attempts = task.attempts;
        if let Err(err) = sink.record_outcome(report).await {
            warn!(
                target: "vigil::pool",
                job = %task.job_id,
                agent = %task.agent,
                "failed to record dead-lettered task: {err}"
            );
        }
    }
}

struct Worker<Q>
where
    Q: WorkQueue + 'static,
{
    worker_id: String,
    queue: Arc<Q>,
    dispatcher: Arc<dyn TaskDispatcher>,
    sink: Arc<dyn OutcomeSink>,
    retry: RetryPolicy,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl<Q> Worker<Q>
where
    Q: WorkQueue + 'static,
{
    async fn run(self) {
        loop {
            if self.shutdown.is_cancelled() {
                info!(target: "vigil::pool", worker = %self.worker_id, "worker shutting down");
                break;
            }

            let leased = tokio::select! {
                _ = self.shutdown.cancelled() => continue,
                leased = self.queue.lease(&self.worker_id, 1) => leased,
            };

            match leased {
                Ok(leases) if !leases.is_empty() => {
                    for lease in leases {
                        let status = self.dispatcher.dispatch(&lease).await;
                        self.settle(&lease, status).await;
                    }
                }
                Ok(_) => self.idle().await,
                Err(err) => {
                    warn!(target: "vigil::pool", worker = %self.worker_id, "lease error: {err}");
                    self.idle().await;
                }
            }
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    async fn settle(&self, lease: &TaskLease, status: DispatchStatus) {
        let task = &lease.task;
        let receipt = lease.receipt();

        match status {
            DispatchStatus::Completed(report) => {
                // Record before ack: a crash in between re-runs the task and
                // the duplicate report is ignored.
                if let Err(err) = self.sink.record_outcome(report).await {
                    warn!(
                        target: "vigil::pool",
                        job = %task.job_id,
                        agent = %task.agent,
                        "outcome not recorded, returning task: {err}"
                    );
                    let delay = self.retry.delay_for(task.id, task.attempts.saturating_add(1));
                    self.retry_or_dead_letter(lease, delay, format!("outcome not recorded: {err}"))
                        .await;
                    return;
                }
                match self.queue.ack(&receipt).await {
                    Ok(()) => {}
                    Err(ScanError::LeaseLost(detail)) => {
                        warn!(target: "vigil::pool", "lease lost before ack ({detail}); outcome already recorded");
                    }
                    Err(err) => warn!(target: "vigil::pool", "queue ack error: {err}"),
                }
            }
            DispatchStatus::Retry { error } => {
                let delay = self.retry.delay_for(task.id, task.attempts.saturating_add(1));
                self.retry_or_dead_letter(lease, delay, error).await;
            }
            DispatchStatus::Discard { reason } => {
                debug!(
                    target: "vigil::pool",
                    job = %task.job_id,
                    agent = %task.agent,
                    %reason,
                    "discarding task"
                );
                if let Err(err) = self.queue.ack(&receipt).await {
                    debug!(target: "vigil::pool", "ack of discarded task failed: {err}");
                }
            }
        }
    }

    async fn retry_or_dead_letter(&self, lease: &TaskLease, delay: Duration, error: String) {
        let task = &lease.task;
        match self
            .queue
            .nack(&lease.receipt(), delay, Some(error.clone()))
            .await
        {
            Ok(NackOutcome::Requeued {
                attempts,
                available_at,
            }) => {
                info!(
                    target: "vigil::pool",
                    job = %task.job_id,
                    agent = %task.agent,
                    attempts,
                    %available_at,
                    "task scheduled for retry"
                );
            }
            Ok(NackOutcome::DeadLettered { attempts }) => {
                warn!(
                    target: "vigil::pool",
                    job = %task.job_id,
                    agent = %task.agent,
                    attempts,
                    "task dead-lettered"
                );
                let mut report = AgentReport::failed(
                    task,
                    format!("retries exhausted after {attempts} attempts: {error}"),
                );
                report.attempts = attempts;
                if let Err(err) = self.sink.record_outcome(report).await {
                    warn!(target: "vigil::pool", "failed to record dead-lettered task: {err}");
                }
            }
            Err(ScanError::LeaseLost(detail)) => {
                warn!(target: "vigil::pool", "lease lost before nack ({detail})");
            }
            Err(err) => warn!(target: "vigil::pool", "queue nack error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::{
        orchestration::{
            config::RetryConfig, memory_queue::InMemoryWorkQueue, task::AgentTask,
        },
        types::{AgentName, JobId, ScanPriority, ScanRequest, TaskOutcome},
    };

    #[derive(Default)]
    struct RecordingSink {
        reports: std::sync::Mutex<Vec<AgentReport>>,
    }

    #[async_trait]
    impl OutcomeSink for RecordingSink {
        async fn record_outcome(&self, report: AgentReport) -> Result<()> {
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    /// Fails every attempt transiently.
    #[derive(Default)]
    struct FlakyDispatcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskDispatcher for FlakyDispatcher {
        async fn dispatch(&self, _lease: &TaskLease) -> DispatchStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            DispatchStatus::Retry {
                error: "connection reset".into(),
            }
        }
    }

    fn config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.dispatcher.workers = 2;
        config.queue.poll_interval_ms = 5;
        config.queue.housekeeper_interval_ms = 10;
        config.retry = RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            jitter_ratio: 0.0,
            jitter_min_ms: 0,
        };
        config
    }

    fn task() -> AgentTask {
        AgentTask::new(
            JobId::new(),
            AgentName::from("x"),
            ScanRequest::new("acme/api", "abc").target(),
            ScanPriority::P1,
            Utc::now() + chrono::Duration::minutes(5),
        )
    }

    async fn wait_for_reports(sink: &RecordingSink, n: usize) {
        for _ in 0..200 {
            if sink.reports.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {n} reports");
    }

    #[tokio::test]
    async fn transient_failures_dead_letter_and_report_failed() {
        let config = config();
        let queue = Arc::new(InMemoryWorkQueue::new(
            config.retry,
            Duration::from_secs(60),
        ));
        let dispatcher = Arc::new(FlakyDispatcher::default());
        let sink = Arc::new(RecordingSink::default());
        let pool = AgentPool::new(config, queue.clone(), dispatcher.clone(), sink.clone());

        queue
            .enqueue(task(), ScanPriority::P1, Utc::now())
            .await
            .unwrap();
        pool.start().await.unwrap();
        wait_for_reports(&sink, 1).await;
        pool.shutdown().await.unwrap();

        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 3);
        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports[0].outcome, TaskOutcome::Failed);
        assert_eq!(reports[0].attempts, 3);
        assert!(
            reports[0]
                .error
                .as_deref()
                .unwrap()
                .starts_with("retries exhausted")
        );
        assert_eq!(queue.snapshot().await.unwrap().dead_letter, 1);
    }

    #[tokio::test]
    async fn housekeeper_caps_dead_letters() {
        let mut config = config();
        config.queue.dead_letter_max = 0;
        let queue = Arc::new(InMemoryWorkQueue::new(
            config.retry,
            Duration::from_secs(60),
        ));
        let sink = Arc::new(RecordingSink::default());
        let pool = AgentPool::new(
            config,
            queue.clone(),
            Arc::new(FlakyDispatcher::default()),
            sink.clone(),
        );

        queue
            .enqueue(task(), ScanPriority::P1, Utc::now())
            .await
            .unwrap();
        pool.start().await.unwrap();
        wait_for_reports(&sink, 1).await;
        for _ in 0..200 {
            if queue.snapshot().await.unwrap().dead_letter == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown().await.unwrap();

        assert_eq!(queue.snapshot().await.unwrap().dead_letter, 0);
        assert_eq!(sink.reports.lock().unwrap()[0].outcome, TaskOutcome::Failed);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let config = config();
        let queue = Arc::new(InMemoryWorkQueue::new(config.retry, Duration::from_secs(60)));
        let pool = AgentPool::new(
            config,
            queue,
            Arc::new(FlakyDispatcher::default()),
            Arc::new(RecordingSink::default()),
        );
        pool.start().await.unwrap();
        assert!(pool.start().await.is_err());
        pool.shutdown().await.unwrap();
        assert!(pool.start().await.is_err());
    }
}
