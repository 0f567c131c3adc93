//! Worker loop: drives dequeued jobs through the build lifecycle.
//!
//! Each worker owns one job at a time; the caches, queue, store, and
//! progress tracker are shared. The loop is strict about its ack
//! discipline: a message is acked whenever the job reached a terminal
//! status (or was an orphan / duplicate), and nacked only when persistence
//! failed transiently, so redelivery can finish the work.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{BuildCache, DetectionCache};
use crate::detection;
use crate::domain::build::{BuildJob, BuildStatus, BuildType};
use crate::domain::deployment::RuntimeConfig;
use crate::domain::policy;
use crate::driver::{BuildDriver, BuildRequest};
use crate::error::{CoreError, ErrorCode, StoreError};
use crate::infrastructure::agent::AgentGateway;
use crate::infrastructure::artifact_cache::ArtifactPusher;
use crate::infrastructure::git::{Checkout, SourceFetcher};
use crate::infrastructure::queue::{QueueMessage, WorkQueue};
use crate::infrastructure::store::{ControlPlaneStore, TransitionUpdate};
use crate::progress::{BuildStage, ProgressTracker};
use crate::services::deployments;
use crate::services::merge;
use crate::services::validator::BuildValidator;

/// Shared collaborators handed to every worker.
pub struct WorkerContext {
    pub store: Arc<dyn ControlPlaneStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub build_cache: Arc<BuildCache>,
    pub detection_cache: Arc<DetectionCache>,
    pub progress: Arc<ProgressTracker>,
    pub driver: Arc<dyn BuildDriver>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub pusher: Arc<dyn ArtifactPusher>,
    pub agent: Arc<AgentGateway>,
    pub validator: BuildValidator,
    pub default_timeout_seconds: i64,
}

/// Why a processing attempt did not end in success.
enum WorkerFailure {
    /// Terminal: fail the job, ack the message.
    Build { code: Option<ErrorCode>, message: String },
    /// Persistence hiccup: leave the job alone, nack for redelivery.
    Transient(String),
}

impl WorkerFailure {
    fn build(code: Option<ErrorCode>, message: impl Into<String>) -> Self {
        Self::Build {
            code,
            message: message.into(),
        }
    }

    fn from_core(err: CoreError) -> Self {
        Self::Build {
            code: Some(err.code()),
            message: err.to_string(),
        }
    }
}

/// What a successful pass produced.
struct BuildOutcome {
    artifact: String,
    cached: bool,
}

/// One worker task.
pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>, shutdown: CancellationToken) -> Self {
        Self { id, ctx, shutdown }
    }

    /// Dequeue and process jobs until shutdown.
    pub async fn run(self) {
        info!(worker = self.id, "worker started");
        loop {
            let message = tokio::select! {
                message = self.ctx.queue.dequeue() => message,
                _ = self.shutdown.cancelled() => None,
            };
            let Some(message) = message else { break };
            self.handle(message).await;
        }
        info!(worker = self.id, "worker stopped");
    }

    /// Process one delivery end to end, including the ack/nack decision.
    pub async fn handle(&self, message: QueueMessage) {
        let build_id = message.job.id.clone();

        // Orphan check: reload from persistence before acting. A missing
        // record, a terminal record (redelivery no-op), or a record some
        // other worker already moved to running is acked untouched.
        let job = match self.ctx.store.get_build(&build_id).await {
            Ok(Some(job)) if job.status == BuildStatus::Queued => job,
            Ok(Some(job)) => {
                debug!(build_id = %build_id, status = %job.status, "skipping non-queued record");
                self.ack(&build_id).await;
                return;
            }
            Ok(None) => {
                debug!(build_id = %build_id, "orphan message; acking without processing");
                self.ack(&build_id).await;
                return;
            }
            Err(e) => {
                warn!(build_id = %build_id, error = %e, "store unavailable; leaving message for redelivery");
                let _ = self.ctx.queue.nack(&build_id).await;
                return;
            }
        };

        // Validate before any build work. An invalid job goes straight
        // from queued to failed, with the error list on the deployment.
        let report = self.ctx.validator.validate(&job);
        if !report.valid {
            let failure = CoreError::validation_failed(report.errors);
            info!(build_id = %build_id, error = %failure, "job failed validation");
            match self
                .ctx
                .store
                .transition_build(
                    &build_id,
                    BuildStatus::Failed,
                    false,
                    TransitionUpdate {
                        artifact: None,
                        error: Some(failure.to_string()),
                    },
                )
                .await
            {
                Ok(_) => {
                    self.ctx.progress.report_stage(&build_id, BuildStage::Failed).await;
                    self.ack(&build_id).await;
                }
                Err(e) if e.is_transient() => {
                    let _ = self.ctx.queue.nack(&build_id).await;
                }
                Err(e) => {
                    error!(build_id = %build_id, error = %e, "could not record validation failure");
                    self.ack(&build_id).await;
                }
            }
            return;
        }
        for warning in &report.warnings {
            debug!(build_id = %build_id, warning = %warning, "validation warning");
        }

        // Transition to running; the deployment flips to building in the
        // same persistence round.
        let job = match self
            .ctx
            .store
            .transition_build(&build_id, BuildStatus::Running, false, TransitionUpdate::default())
            .await
        {
            Ok(job) => job,
            Err(e) if e.is_transient() => {
                let _ = self.ctx.queue.nack(&build_id).await;
                return;
            }
            Err(e) => {
                error!(build_id = %build_id, error = %e, "cannot start job");
                self.ack(&build_id).await;
                return;
            }
        };

        // Effective timeout from the job and its user config; the merged
        // config cannot shorten or extend it later.
        let timeout = merge::effective_timeout(
            job.timeout_seconds,
            job.build_config.as_ref(),
            self.ctx.default_timeout_seconds,
        );

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.run_build(job.clone(), timeout)) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(WorkerFailure::from_core(CoreError::BuildTimeout {
                    seconds: timeout.as_secs(),
                })),
            },
            _ = self.shutdown.cancelled() => {
                Err(WorkerFailure::build(None, "worker shut down mid-build"))
            }
        };

        match outcome {
            Ok(outcome) => self.finalize_success(&build_id, outcome).await,
            Err(WorkerFailure::Transient(reason)) => {
                warn!(build_id = %build_id, reason = %reason, "transient failure; message will be redelivered");
                let _ = self.ctx.queue.nack(&build_id).await;
            }
            Err(WorkerFailure::Build { code, message }) => {
                self.finalize_failure(&build_id, code, message).await;
            }
        }
    }

    /// The build body: detection, config merge, cache lookup, driver
    /// dispatch, and closure push.
    async fn run_build(
        &self,
        mut job: BuildJob,
        timeout: Duration,
    ) -> Result<BuildOutcome, WorkerFailure> {
        let build_id = job.id.clone();

        // Checkout for git sources; detection and most drivers need it.
        let checkout = if job.needs_checkout() {
            self.report(&build_id, BuildStage::Cloning, 10, "fetching sources").await;
            let checkout = self
                .ctx
                .fetcher
                .fetch(&job.git_url, &job.git_ref)
                .await
                .map_err(|e| WorkerFailure::build(None, format!("source fetch failed: {:#}", e)))?;
            Some(checkout)
        } else {
            None
        };

        // Detection, through the cache, when the strategy asks for it.
        let detected = self.detect_if_needed(&mut job, checkout.as_ref()).await?;

        // Config merge: user config over detected defaults.
        let effective_config = merge::merge(detected.as_ref(), job.build_config.as_ref());

        // Build-type enforcement, including the retry-as-oci control.
        let strategy = job.strategy();
        let (mut build_type, overridden) = policy::enforce_build_type(strategy, &job.build_type);
        if job.retry_as_oci && job.retry_count > 0 {
            build_type = BuildType::Oci;
        }
        if overridden {
            debug!(build_id = %build_id, build_type = %build_type, "build type forced by strategy");
        }
        if job.build_type != build_type.as_str() {
            job.build_type = build_type.as_str().to_string();
            self.persist(&job).await?;
        }

        // Recipe synthesis for auto-* strategies.
        if let Some(strategy) = strategy.filter(|s| s.is_synthesized()) {
            self.report(&build_id, BuildStage::Generating, 30, "synthesizing recipe").await;
            let recipe = crate::driver::generate_recipe(strategy, &effective_config, &job);
            job.generated_recipe = Some(recipe);
            job.lock_file = checkout.as_ref().and_then(|c| find_lock_file(&c.path));
            self.persist(&job).await?;
        }

        // Fingerprint, then hold the fingerprint lock across the
        // check / build / store sequence: at most one driver invocation
        // per fingerprint, and concurrent twins observe the same artifact.
        self.report(&build_id, BuildStage::CalculatingHash, 40, "computing fingerprint").await;
        let key = BuildCache::cache_key(&job).map_err(WorkerFailure::from_core)?;
        let _fingerprint_guard = self.ctx.build_cache.lock_fingerprint(&key).await;

        match self.ctx.build_cache.check(&key).await {
            Ok(cached) => {
                info!(build_id = %build_id, key = %key, "build cache hit");
                return Ok(BuildOutcome {
                    artifact: cached.artifact,
                    cached: true,
                });
            }
            Err(err) if matches!(err.code(), ErrorCode::CacheNotFound | ErrorCode::CacheExpired) => {
                debug!(build_id = %build_id, code = %err.code(), "build cache miss");
            }
            Err(err) => return Err(WorkerFailure::from_core(err)),
        }

        // Delegate to the external driver.
        self.report(&build_id, BuildStage::Building, 50, "driver running").await;
        let request = BuildRequest {
            job: job.clone(),
            effective_config,
            build_type,
            checkout: checkout.as_ref().map(|c| c.path.clone()),
            timeout,
        };
        let result = self
            .ctx
            .driver
            .build(&request)
            .await
            .map_err(|e| WorkerFailure::build(None, format!("build failed: {:#}", e)))?;

        if result.is_empty() {
            return Err(WorkerFailure::from_core(CoreError::NilResult));
        }
        policy::validate_artifact(build_type, &result.artifact)
            .map_err(WorkerFailure::from_core)?;

        // Pure builds push the closure before the job may succeed; image
        // builds never see the pusher.
        if build_type == BuildType::PureNix {
            let store_path = result
                .store_path
                .as_deref()
                .ok_or_else(|| WorkerFailure::from_core(CoreError::NilResult))?;
            self.report(&build_id, BuildStage::Pushing, 90, "pushing closure").await;
            self.ctx
                .pusher
                .push_closure(store_path)
                .await
                .map_err(|e| WorkerFailure::build(None, format!("closure push failed: {:#}", e)))?;
        }

        // Cache write. A failed write is an optimization lost, not a
        // failed build.
        if let Err(e) = self.ctx.build_cache.store(&key, &result, Some(&job)).await {
            warn!(build_id = %build_id, error = %e, "could not write build cache entry");
        }

        Ok(BuildOutcome {
            artifact: result.artifact,
            cached: false,
        })
    }

    /// Consult the detection cache and run detection on a miss. Returns
    /// the suggested-config map when detection ran.
    async fn detect_if_needed(
        &self,
        job: &mut BuildJob,
        checkout: Option<&Checkout>,
    ) -> Result<Option<BTreeMap<String, String>>, WorkerFailure> {
        let wants_detection = job.build_strategy.is_empty()
            || job.strategy().map(|s| s.requires_detection()).unwrap_or(false);
        if !wants_detection {
            return Ok(None);
        }
        let Some(checkout) = checkout else {
            debug!(build_id = %job.id, "detection requested but no checkout; skipping");
            return Ok(None);
        };

        self.report(&job.id, BuildStage::Detecting, 20, "detecting language").await;

        let result = match self
            .ctx
            .detection_cache
            .get(&job.git_url, &checkout.commit_sha)
            .await
        {
            Some(result) => result,
            None => {
                let result = detection::detect(&checkout.path).map_err(WorkerFailure::from_core)?;
                if let Err(e) = self
                    .ctx
                    .detection_cache
                    .set(&job.git_url, &checkout.commit_sha, &result)
                    .await
                {
                    debug!(build_id = %job.id, error = %e, "detection result not cached");
                }
                result
            }
        };

        job.build_strategy = result.strategy.clone();
        if job.build_type.is_empty() && !result.recommended_build_type.is_empty() {
            job.build_type = result.recommended_build_type.clone();
        }
        self.persist(job).await?;

        Ok(Some(result.suggested_config))
    }

    async fn finalize_success(&self, build_id: &str, outcome: BuildOutcome) {
        match self
            .ctx
            .store
            .transition_build(
                build_id,
                BuildStatus::Succeeded,
                false,
                TransitionUpdate {
                    artifact: Some(outcome.artifact.clone()),
                    error: None,
                },
            )
            .await
        {
            Ok(job) => {
                self.ctx
                    .progress
                    .report_progress(build_id, 100, if outcome.cached { "cache hit" } else { "built" })
                    .await;
                self.ctx.progress.report_stage(build_id, BuildStage::Completed).await;
                self.ack(build_id).await;
                info!(build_id = %build_id, artifact = %outcome.artifact, cached = outcome.cached, "build succeeded");
                self.emit_deploy_command(&job.deployment_id).await;
            }
            Err(e) if e.is_transient() => {
                // The cache entry (if written) stays; redelivery retries
                // the terminal persistence round.
                warn!(build_id = %build_id, error = %e, "success not persisted; leaving for redelivery");
                let _ = self.ctx.queue.nack(build_id).await;
            }
            Err(e) => {
                error!(build_id = %build_id, error = %e, "success transition rejected");
                self.ack(build_id).await;
            }
        }
    }

    async fn finalize_failure(&self, build_id: &str, code: Option<ErrorCode>, message: String) {
        let message = match code {
            Some(code) => format!("{}: {}", code, message),
            None => message,
        };
        info!(build_id = %build_id, error = %message, "build failed");

        let result = self
            .ctx
            .store
            .transition_build(
                build_id,
                BuildStatus::Failed,
                false,
                TransitionUpdate {
                    artifact: None,
                    error: Some(message),
                },
            )
            .await;

        match result {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { ref from, .. })
                if from == BuildStatus::Succeeded.as_str() || from == BuildStatus::Failed.as_str() =>
            {
                // Already terminal; a fresh transition is not required.
                debug!(build_id = %build_id, "job already terminal");
            }
            Err(ref e) if e.is_transient() => {
                let _ = self.ctx.queue.nack(build_id).await;
                return;
            }
            Err(e) => {
                error!(build_id = %build_id, error = %e, "failure transition rejected");
            }
        }

        self.ctx.progress.report_stage(build_id, BuildStage::Failed).await;
        self.ack(build_id).await;
    }

    /// Hand the built deployment to the node agent, best effort.
    async fn emit_deploy_command(&self, deployment_id: &str) {
        if !self.ctx.agent.is_enabled() {
            return;
        }
        match self.ctx.store.get_deployment(deployment_id).await {
            Ok(Some(deployment)) => {
                match deployments::build_deploy_command(
                    &deployment,
                    RuntimeConfig::default(),
                    BTreeMap::new(),
                ) {
                    Ok(command) => self.ctx.agent.send_deploy_command(&command).await,
                    Err(e) => {
                        warn!(deployment_id = %deployment_id, error = %e, "deploy command not emitted");
                    }
                }
            }
            Ok(None) => {
                warn!(deployment_id = %deployment_id, "deployment record missing after success");
            }
            Err(e) => {
                warn!(deployment_id = %deployment_id, error = %e, "could not load deployment for dispatch");
            }
        }
    }

    async fn persist(&self, job: &BuildJob) -> Result<(), WorkerFailure> {
        match self.ctx.store.update_build(job).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => Err(WorkerFailure::Transient(e.to_string())),
            Err(e) => Err(WorkerFailure::build(None, e.to_string())),
        }
    }

    async fn report(&self, build_id: &str, stage: BuildStage, percent: u8, message: &str) {
        self.ctx.progress.report_stage(build_id, stage).await;
        self.ctx.progress.report_progress(build_id, percent, message).await;
    }

    async fn ack(&self, build_id: &str) {
        if let Err(e) = self.ctx.queue.ack(build_id).await {
            // Redelivery will hit the terminal-record no-op path.
            warn!(build_id = %build_id, error = %e, "ack failed");
        }
    }
}

/// Known dependency lock files, checked in order.
fn find_lock_file(checkout: &std::path::Path) -> Option<String> {
    ["go.sum", "Cargo.lock", "package-lock.json", "yarn.lock", "poetry.lock", "uv.lock"]
        .into_iter()
        .find(|name| checkout.join(name).is_file())
        .map(|name| name.to_string())
}

/// A pool of workers sharing one context and shutdown token.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `count` workers.
    pub fn spawn(count: usize, ctx: Arc<WorkerContext>, shutdown: CancellationToken) -> Self {
        let count = count.max(1);
        let handles = (0..count)
            .map(|id| {
                let worker = Worker::new(id, ctx.clone(), shutdown.clone());
                tokio::spawn(worker.run())
            })
            .collect();
        info!(workers = count, "worker pool started");
        Self { handles, shutdown }
    }

    /// Cancel in-flight work and wait for every worker to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}
