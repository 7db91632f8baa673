//! Vigil process entry point.
//!
//! `vigil run` hosts the agent pool, lease housekeeper and deadline sweeper;
//! `vigil scan` submits one scan and waits for it; `vigil check-config`
//! validates the deployment configuration and probes every agent.

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_config::{VigilConfig, VigilConfigSource};
use vigil_core::{
    AgentRegistry, ScanOrchestrator,
    cache::{InMemoryResultCache, RedisResultCache, ResultCache},
    orchestration::{
        InMemoryJobStore, InMemoryWorkQueue, InProcJobEventBus, JobEventPayload,
        JobStore, RedisJobStore, RedisWorkQueue, WorkQueue,
    },
    types::{JobStatus, ScanMode, ScanPriority, ScanRequest},
};

mod agents;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(about = "Runs security-analysis agents and merges their findings")]
struct Cli {
    /// Configuration file (TOML or JSON). Skips discovery when set.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the agent pool until Ctrl-C (default)
    Run,
    /// Submit one scan, wait for a terminal status and print the job as JSON
    Scan(ScanArgs),
    /// Validate the configuration, print it and probe every agent
    CheckConfig,
}

#[derive(ClapArgs, Debug, Clone)]
struct ScanArgs {
    /// Repository identifier
    #[arg(long)]
    repo: String,

    /// Clone URL handed to agents
    #[arg(long)]
    repo_url: Option<String>,

    /// Commit to scan
    #[arg(long)]
    commit: String,

    #[arg(long)]
    branch: Option<String>,

    /// Detected language (repeatable); selects applicable agents
    #[arg(long = "language")]
    languages: Vec<String>,

    /// Agent to run (repeatable); overrides language-based selection
    #[arg(long = "agent")]
    agents: Vec<String>,

    /// Restrict the scan to these paths (repeatable)
    #[arg(long = "file")]
    files: Vec<String>,

    /// full, incremental or interactive
    #[arg(long, default_value = "full", value_parser = parse_mode)]
    mode: ScanMode,

    /// Priority tier, 0 (highest) to 3
    #[arg(long, default_value = "1", value_parser = parse_priority)]
    priority: ScanPriority,
}

fn parse_mode(raw: &str) -> Result<ScanMode, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))
        .map_err(|_| format!("unknown scan mode {raw:?}"))
}

fn parse_priority(raw: &str) -> Result<ScanPriority, String> {
    raw.trim_start_matches(['p', 'P'])
        .parse::<u8>()
        .ok()
        .and_then(ScanPriority::from_tier)
        .ok_or_else(|| format!("priority must be 0-3, got {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let (config, source) = match &cli.config {
        Some(path) => VigilConfig::load_path(path),
        None => VigilConfig::load_from_env(),
    }
    .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &source {
        VigilConfigSource::Default => info!("no configuration found; using defaults"),
        VigilConfigSource::EnvPath(path) | VigilConfigSource::File(path) => {
            info!(path = %path.display(), "configuration loaded from file")
        }
        VigilConfigSource::EnvInline => {
            info!("configuration loaded from inline environment json")
        }
    }

    config.validate().context("invalid configuration")?;
    let registry = Arc::new(
        agents::build_registry(&config.agents)
            .context("failed to register agents")?,
    );
    if registry.is_empty() {
        warn!("no agents configured; every scan will complete without findings");
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::CheckConfig => check_config(&config, &registry).await,
        command => launch(config, registry, command).await,
    }
}

async fn check_config(
    config: &VigilConfig,
    registry: &AgentRegistry,
) -> anyhow::Result<ExitCode> {
    println!("{}", config.to_toml()?);

    let mut healthy = true;
    for (agent, status) in registry.health_report().await {
        match status {
            Ok(()) => println!("agent {agent}: ok"),
            Err(err) => {
                healthy = false;
                println!("agent {agent}: {err}");
            }
        }
    }
    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Picks the backends and hands over to [`execute`].
async fn launch(
    config: VigilConfig,
    registry: Arc<AgentRegistry>,
    command: Command,
) -> anyhow::Result<ExitCode> {
    let orchestrator_config = config.orchestrator;
    let prefix = orchestrator_config.queue.key_prefix.clone();
    let events = Arc::new(InProcJobEventBus::default());

    match config.redis_url.as_deref() {
        Some(url) => {
            let queue = RedisWorkQueue::connect(
                url,
                &prefix,
                orchestrator_config.retry,
                orchestrator_config.queue.visibility_timeout(),
            )
            .await
            .context("failed to connect work queue")?;
            let store = RedisJobStore::connect(url, &prefix)
                .await
                .context("failed to connect job store")?;
            let cache = RedisResultCache::connect(url, &prefix)
                .await
                .context("failed to connect result cache")?;
            let orchestrator = ScanOrchestrator::new(
                orchestrator_config,
                Arc::new(queue),
                Arc::new(store),
                Arc::new(cache),
                registry,
                events.clone(),
            )?;
            execute(Arc::new(orchestrator), events, command).await
        }
        None => {
            info!("no redis_url configured; queue, job store and cache are in-memory");
            let queue = InMemoryWorkQueue::new(
                orchestrator_config.retry,
                orchestrator_config.queue.visibility_timeout(),
            );
            let orchestrator = ScanOrchestrator::new(
                orchestrator_config,
                Arc::new(queue),
                Arc::new(InMemoryJobStore::new()),
                Arc::new(InMemoryResultCache::new()),
                registry,
                events.clone(),
            )?;
            execute(Arc::new(orchestrator), events, command).await
        }
    }
}

async fn execute<Q, S, C>(
    orchestrator: Arc<ScanOrchestrator<Q, S, C>>,
    events: Arc<InProcJobEventBus>,
    command: Command,
) -> anyhow::Result<ExitCode>
where
    Q: WorkQueue + 'static,
    S: JobStore + 'static,
    C: ResultCache + 'static,
{
    let pool = orchestrator.agent_pool();
    pool.start().await.context("failed to start agent pool")?;
    let shutdown = pool.shutdown_token();
    let sweeper = orchestrator.spawn_deadline_sweeper(shutdown.clone());
    let event_log = spawn_event_log(&events, shutdown);

    let outcome = match command {
        Command::Scan(args) => run_scan(&orchestrator, args).await,
        _ => {
            for (agent, status) in orchestrator.registry().health_report().await {
                if let Err(err) = status {
                    warn!(agent = %agent, "agent health check failed: {err}");
                }
            }
            info!(
                workers = orchestrator.config().dispatcher.workers,
                agents = orchestrator.registry().len(),
                "vigil running; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            info!("shutdown requested");
            Ok(ExitCode::SUCCESS)
        }
    };

    pool.shutdown()
        .await
        .context("agent pool did not shut down cleanly")?;
    for handle in [sweeper, event_log] {
        if let Err(err) = handle.await {
            warn!("background task ended abnormally: {err}");
        }
    }
    outcome
}

async fn run_scan<Q, S, C>(
    orchestrator: &ScanOrchestrator<Q, S, C>,
    args: ScanArgs,
) -> anyhow::Result<ExitCode>
where
    Q: WorkQueue + 'static,
    S: JobStore + 'static,
    C: ResultCache + 'static,
{
    let request = ScanRequest {
        repository: args.repo,
        repository_url: args.repo_url,
        commit: args.commit,
        branch: args.branch,
        languages: args.languages,
        files: args.files,
        mode: args.mode,
        priority: args.priority,
        agents: (!args.agents.is_empty()).then_some(args.agents),
    };
    let job_id = orchestrator
        .submit_scan(request)
        .await
        .context("scan submission failed")?;
    info!(job = %job_id, "scan submitted; waiting for agents");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let job = loop {
        let job = orchestrator.get_status(job_id).await?;
        if job.status.is_terminal() {
            break job;
        }
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!(job = %job_id, "interrupted; cancelling scan");
                match orchestrator.cancel_scan(job_id).await {
                    Ok(job) => break job,
                    // Finished between the status check and the cancel.
                    Err(_) => break orchestrator.get_status(job_id).await?,
                }
            }
            _ = tokio::time::sleep(SCAN_POLL_INTERVAL) => {}
        }
    };

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(if job.status == JobStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn spawn_event_log(
    events: &InProcJobEventBus,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut stream = BroadcastStream::new(events.subscribe());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => match event.payload {
                        JobEventPayload::Finalized { status, findings } => {
                            info!(target: "vigil::orchestrator", job = %event.job_id, %status, findings, "scan finished");
                        }
                        JobEventPayload::CacheHit => {
                            info!(target: "vigil::orchestrator", job = %event.job_id, "scan answered from cache");
                        }
                        _ => {}
                    },
                    Some(Err(err)) => warn!(target: "vigil::orchestrator", "event log fell behind: {err}"),
                    None => break,
                },
            }
        }
    })
}
