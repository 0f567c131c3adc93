//! Durable records of build jobs and deployments.
//!
//! The store owns both entities so the job-then-deployment write order can
//! happen inside one write boundary: a status transition verifies the
//! stored status, appends a transition-log entry, and syncs the linked
//! deployment in the same round. A transition is observed only once the
//! store call returns; a subsequent `get` sees the new status.
//!
//! Updates are conditional, never last-writer-wins: non-status job updates
//! refuse to change `status`, deployment updates carry an optimistic
//! `updated_at` check, and transitions are validated against the state
//! machine table under the write lock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::build::{can_transition, BuildJob, BuildStatus, StatusTransition};
use crate::domain::deployment::{Deployment, DeploymentStatus};
use crate::error::StoreError;

/// Filter for build listings; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct BuildFilter {
    pub app_id: Option<String>,
    pub deployment_id: Option<String>,
    pub status: Option<BuildStatus>,
}

/// Side effects applied atomically with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    /// Artifact written to the job and, on success, to the deployment.
    /// Never applied to the deployment on failure.
    pub artifact: Option<String>,
    /// Error recorded on the job and surfaced as the deployment message.
    pub error: Option<String>,
}

/// Persistence seam for build jobs.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn create_build(&self, job: BuildJob) -> Result<(), StoreError>;

    async fn get_build(&self, id: &str) -> Result<Option<BuildJob>, StoreError>;

    /// Update non-status fields. Refuses status changes; those go through
    /// [`BuildStore::transition_build`].
    async fn update_build(&self, job: &BuildJob) -> Result<(), StoreError>;

    /// Transition a job's status.
    ///
    /// Atomically: verifies the stored status admits `to` per the state
    /// machine, stamps `started_at`/`finished_at`, applies the update's
    /// artifact/error, appends the transition-log entry, and syncs the
    /// linked deployment (`running=>building`, `succeeded=>built`,
    /// `failed=>failed`). Returns the updated job.
    async fn transition_build(
        &self,
        id: &str,
        to: BuildStatus,
        is_retry: bool,
        update: TransitionUpdate,
    ) -> Result<BuildJob, StoreError>;

    async fn list_builds(&self, filter: BuildFilter) -> Result<Vec<BuildJob>, StoreError>;

    async fn delete_build(&self, id: &str) -> Result<(), StoreError>;

    /// The append-only transition log for one job, in insertion order.
    async fn transitions(&self, build_id: &str) -> Result<Vec<StatusTransition>, StoreError>;
}

/// Persistence seam for deployments.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn create_deployment(&self, deployment: Deployment) -> Result<(), StoreError>;

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError>;

    /// Optimistic update: the caller's `updated_at` must match the stored
    /// record's, and the store bumps it on write.
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;

    async fn list_deployments(&self, app_id: Option<&str>) -> Result<Vec<Deployment>, StoreError>;

    async fn delete_deployment(&self, id: &str) -> Result<(), StoreError>;
}

/// Combined persistence seam: the store owns both entities (design note:
/// that is what lets a build transition sync its deployment in one round).
pub trait ControlPlaneStore: BuildStore + DeploymentStore {}

impl<T: BuildStore + DeploymentStore> ControlPlaneStore for T {}

#[derive(Default)]
struct Inner {
    builds: HashMap<String, BuildJob>,
    deployments: HashMap<String, Deployment>,
    transitions: Vec<StatusTransition>,
}

/// In-memory reference store. One lock guards both entity maps and the
/// transition log, which is what makes the same-round guarantees hold.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn create_build(&self, job: BuildJob) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.builds.contains_key(&job.id) {
            return Err(StoreError::Conflict {
                id: job.id.clone(),
                reason: "build already exists".into(),
            });
        }
        debug!(build_id = %job.id, "created build record");
        inner.builds.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_build(&self, id: &str) -> Result<Option<BuildJob>, StoreError> {
        Ok(self.inner.read().await.builds.get(id).cloned())
    }

    async fn update_build(&self, job: &BuildJob) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .builds
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::NotFound { id: job.id.clone() })?;
        if stored.status != job.status {
            return Err(StoreError::Conflict {
                id: job.id.clone(),
                reason: format!(
                    "status change {} -> {} must go through a transition",
                    stored.status, job.status
                ),
            });
        }
        *stored = job.clone();
        Ok(())
    }

    async fn transition_build(
        &self,
        id: &str,
        to: BuildStatus,
        is_retry: bool,
        update: TransitionUpdate,
    ) -> Result<BuildJob, StoreError> {
        let mut inner = self.inner.write().await;

        let from = inner
            .builds
            .get(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?
            .status;

        if !can_transition(from, to, is_retry) {
            return Err(StoreError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        let deployment_id;
        let job = {
            let job = inner
                .builds
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
            job.status = to;
            match to {
                BuildStatus::Running => job.started_at = Some(now),
                BuildStatus::Succeeded | BuildStatus::Failed => job.finished_at = Some(now),
                BuildStatus::Queued => {
                    // Retry: the next pickup stamps a fresh started_at.
                    job.retry_count += 1;
                    job.started_at = None;
                    job.finished_at = None;
                }
            }
            if let Some(artifact) = &update.artifact {
                job.artifact = artifact.clone();
            }
            if let Some(error) = &update.error {
                job.error = Some(error.clone());
            }
            deployment_id = job.deployment_id.clone();
            job.clone()
        };

        inner.transitions.push(StatusTransition {
            build_id: id.to_string(),
            from,
            to,
            timestamp: now,
        });

        // Deployment sync inside the same write round.
        if let Some(deployment) = inner.deployments.get_mut(&deployment_id) {
            deployment.status = DeploymentStatus::from_build_status(to);
            deployment.updated_at = now;
            match to {
                BuildStatus::Succeeded => {
                    if let Some(artifact) = &update.artifact {
                        deployment.artifact = artifact.clone();
                    }
                    deployment.build_type = job.build_type.clone();
                    deployment.status_message = None;
                }
                BuildStatus::Failed => {
                    // Artifact preserved from any earlier successful build.
                    deployment.status_message = update.error.clone();
                }
                BuildStatus::Running | BuildStatus::Queued => {}
            }
        }

        debug!(build_id = %id, from = %from, to = %to, "transitioned build");
        Ok(job)
    }

    async fn list_builds(&self, filter: BuildFilter) -> Result<Vec<BuildJob>, StoreError> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<BuildJob> = inner
            .builds
            .values()
            .filter(|job| {
                filter.app_id.as_deref().map_or(true, |a| job.app_id == a)
                    && filter
                        .deployment_id
                        .as_deref()
                        .map_or(true, |d| job.deployment_id == d)
                    && filter.status.map_or(true, |s| job.status == s)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn delete_build(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .builds
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn transitions(&self, build_id: &str) -> Result<Vec<StatusTransition>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .transitions
            .iter()
            .filter(|t| t.build_id == build_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn create_deployment(&self, deployment: Deployment) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.deployments.contains_key(&deployment.id) {
            return Err(StoreError::Conflict {
                id: deployment.id.clone(),
                reason: "deployment already exists".into(),
            });
        }
        inner.deployments.insert(deployment.id.clone(), deployment);
        Ok(())
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError> {
        Ok(self.inner.read().await.deployments.get(id).cloned())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .deployments
            .get_mut(&deployment.id)
            .ok_or_else(|| StoreError::NotFound {
                id: deployment.id.clone(),
            })?;
        if stored.updated_at != deployment.updated_at {
            return Err(StoreError::Conflict {
                id: deployment.id.clone(),
                reason: "stale update: record changed since read".into(),
            });
        }
        let mut next = deployment.clone();
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn list_deployments(&self, app_id: Option<&str>) -> Result<Vec<Deployment>, StoreError> {
        let inner = self.inner.read().await;
        let mut deployments: Vec<Deployment> = inner
            .deployments
            .values()
            .filter(|d| app_id.map_or(true, |a| d.app_id == a))
            .cloned()
            .collect();
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deployments)
    }

    async fn delete_deployment(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .deployments
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }
}
