use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod cache;
mod cli;
mod config;
mod detection;
mod domain;
mod driver;
mod error;
mod infrastructure;
mod progress;
mod services;

use cache::{BuildCache, DetectionCache};
use cli::{Cli, Commands};
use config::ControlPlaneConfig;
use domain::build::{BuildJob, BuildStatus};
use driver::NixDriver;
use infrastructure::agent::{AgentGateway, NodeAgentClient};
use infrastructure::artifact_cache::BinaryCacheClient;
use infrastructure::git::{GitFetcher, TokenGitProvider};
use infrastructure::queue::MemoryQueue;
use infrastructure::store::{BuildStore, MemoryStore};
use progress::ProgressTracker;
use services::submission::SubmissionService;
use services::validator::BuildValidator;
use services::worker::{WorkerContext, WorkerPool};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with LOGGING env var support
    // LOGGING=debug,info,warn,error or just LOGGING=debug
    let log_level = std::env::var("LOGGING")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| {
            if cli.verbose {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(false)
        .init();

    match cli.command {
        Commands::Serve {
            config,
            workers,
            jobs,
            drain,
        } => {
            let mut config = ControlPlaneConfig::load_or_default(config.as_deref().map(Path::new))?;
            if let Some(workers) = workers {
                config.workers = workers;
            }
            serve(config, jobs, drain).await?;
        }
        Commands::Validate { file, config } => {
            let config = ControlPlaneConfig::load_or_default(config.as_deref().map(Path::new))?;
            validate(&file, &config)?;
        }
        Commands::Detect { path, json } => {
            detect(&path, json)?;
        }
    }

    Ok(())
}

/// Run the worker pool until interrupted (or drained, with `--drain`).
async fn serve(config: ControlPlaneConfig, jobs: Option<String>, drain: bool) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());

    let agent = if config.agent.base_url.is_empty() {
        AgentGateway::disabled()
    } else {
        AgentGateway::new(Some(NodeAgentClient::new(
            config.agent.base_url.clone(),
            config.agent.timeout(),
        )?))
    };

    let context = Arc::new(WorkerContext {
        store: store.clone(),
        queue: queue.clone(),
        build_cache: Arc::new(BuildCache::new(config.build_cache.ttl)),
        detection_cache: Arc::new(DetectionCache::new(config.detection_cache.ttl)),
        progress: Arc::new(ProgressTracker::new()),
        driver: Arc::new(NixDriver::new()),
        fetcher: Arc::new(GitFetcher::new(TokenGitProvider::from_env())),
        pusher: Arc::new(BinaryCacheClient::discover(
            config.binary_cache.cache_name.clone(),
            config.binary_cache.server_url.clone(),
        )),
        agent: Arc::new(agent),
        validator: BuildValidator::new(config.strategy_registry.clone()),
        default_timeout_seconds: config.default_build_timeout_seconds,
    });

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(config.workers, context.clone(), shutdown.clone());

    // Periodic TTL sweep over both caches.
    let sweeper = {
        let build_cache = context.build_cache.clone();
        let detection_cache = context.detection_cache.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = build_cache.cleanup_expired().await
                            + detection_cache.cleanup_expired().await;
                        if removed > 0 {
                            debug!(removed, "swept expired cache entries");
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        })
    };

    let submitted = match jobs {
        Some(path) => {
            let submission = SubmissionService::new(
                store.clone(),
                queue.clone(),
                BuildValidator::new(config.strategy_registry.clone()),
            );
            submit_file(&submission, Path::new(&path)).await?
        }
        None => Vec::new(),
    };

    if drain {
        drain_jobs(&*store, &submitted).await;
        info!("all submitted jobs terminal; shutting down");
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("shutdown signal received");
    }

    queue.close();
    pool.shutdown().await;
    let _ = sweeper.await;
    Ok(())
}

/// Submit every job draft in a spec file. The file holds one job or a
/// list of jobs, in YAML or JSON.
async fn submit_file(submission: &SubmissionService, path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let drafts: Vec<BuildJob> = match serde_yaml::from_str::<Vec<BuildJob>>(&content) {
        Ok(drafts) => drafts,
        Err(_) => vec![serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?],
    };

    let mut ids = Vec::new();
    for draft in drafts {
        match submission.submit(draft).await {
            Ok(job) => {
                println!("submitted {}", job.id.green());
                ids.push(job.id);
            }
            Err(e) => {
                warn!(error = %e, "submission rejected");
                println!("{} {:#}", "rejected:".red(), e);
            }
        }
    }
    Ok(ids)
}

/// Poll until every listed job is terminal.
async fn drain_jobs(store: &MemoryStore, ids: &[String]) {
    loop {
        let mut all_terminal = true;
        for id in ids {
            match store.get_build(id).await {
                Ok(Some(job)) if !job.status.is_terminal() => {
                    all_terminal = false;
                    break;
                }
                _ => {}
            }
        }
        if all_terminal {
            for id in ids {
                if let Ok(Some(job)) = store.get_build(id).await {
                    let status = match job.status {
                        BuildStatus::Succeeded => job.status.to_string().green(),
                        BuildStatus::Failed => job.status.to_string().red(),
                        _ => job.status.to_string().normal(),
                    };
                    println!("{}  {}  {}", job.id, status, job.artifact);
                }
            }
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Offline validation of a job spec file.
fn validate(file: &str, config: &ControlPlaneConfig) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file))?;
    let job: BuildJob =
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", file))?;

    let validator = BuildValidator::new(config.strategy_registry.clone());
    let report = validator.validate(&job);

    for warning in &report.warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }
    if report.valid {
        println!("{}", "valid".green().bold());
        Ok(())
    } else {
        for error in &report.errors {
            println!("{} {}", "error:".red(), error);
        }
        anyhow::bail!("validation failed with {} error(s)", report.errors.len());
    }
}

/// Offline detection over a local tree.
fn detect(path: &str, json: bool) -> Result<()> {
    let result = detection::detect(Path::new(path))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("strategy:   {}", result.strategy.bold());
    if !result.framework.is_empty() {
        println!("framework:  {}", result.framework);
    }
    if !result.language_version.is_empty() {
        println!("version:    {}", result.language_version);
    }
    println!("build type: {}", result.recommended_build_type);
    println!("confidence: {:.2}", result.confidence);
    for entry in &result.entry_points {
        let marker = if entry.is_default { "*" } else { " " };
        println!("  {} {}  ({})", marker, entry.path, entry.description);
    }
    for warning in &result.warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }
    Ok(())
}
