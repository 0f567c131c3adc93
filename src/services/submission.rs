//! Submission flow: validate, persist as queued, enqueue.
//!
//! A submission that fails validation is rejected before anything is
//! persisted; the queued-to-failed path in the worker exists for jobs
//! that reach the queue through other doors (replays, direct enqueues).

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::build::{BuildJob, SourceType};
use crate::domain::deployment::Deployment;
use crate::error::CoreError;
use crate::infrastructure::queue::WorkQueue;
use crate::infrastructure::store::ControlPlaneStore;
use crate::services::validator::BuildValidator;

/// Accepts build jobs into the control plane.
pub struct SubmissionService {
    store: Arc<dyn ControlPlaneStore>,
    queue: Arc<dyn WorkQueue>,
    validator: BuildValidator,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        queue: Arc<dyn WorkQueue>,
        validator: BuildValidator,
    ) -> Self {
        Self {
            store,
            queue,
            validator,
        }
    }

    /// Submit a job: normalize identity and source, validate, create the
    /// deployment record if absent, persist the job as queued, enqueue.
    /// Returns the job as persisted.
    pub async fn submit(&self, mut job: BuildJob) -> Result<BuildJob> {
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
        }

        self.normalize_source(&mut job)?;

        let report = self.validator.validate(&job);
        if !report.valid {
            return Err(CoreError::validation_failed(report.errors).into());
        }
        for warning in &report.warnings {
            warn!(build_id = %job.id, warning = %warning, "submission warning");
        }

        if self
            .store
            .get_deployment(&job.deployment_id)
            .await
            .map_err(CoreError::from)?
            .is_none()
        {
            let mut deployment = Deployment::new(&job.deployment_id, &job.app_id);
            deployment.service_name = job.service_name.clone().unwrap_or_default();
            deployment.build_type = job.build_type.clone();
            self.store
                .create_deployment(deployment)
                .await
                .map_err(CoreError::from)?;
        }

        self.store
            .create_build(job.clone())
            .await
            .map_err(CoreError::from)?;

        self.queue
            .enqueue(&job)
            .await
            .context("job persisted but not enqueued")?;

        info!(build_id = %job.id, deployment_id = %job.deployment_id, "build job submitted");
        Ok(job)
    }

    /// Enforce the source-shape invariant: exactly one source consistent
    /// with the declared type. Git sources get their recipe URI derived
    /// here.
    fn normalize_source(&self, job: &mut BuildJob) -> Result<(), CoreError> {
        match job.source_type {
            SourceType::Git => {
                if job.git_url.is_empty() {
                    return Err(CoreError::RequiredField {
                        field: "git_url".into(),
                    });
                }
                job.flake_uri = job.derive_flake_uri();
                Ok(())
            }
            SourceType::Flake => {
                if job.flake_uri.is_empty() {
                    return Err(CoreError::RequiredField {
                        field: "flake_uri".into(),
                    });
                }
                if !job.git_url.is_empty() {
                    return Err(CoreError::InvalidValue {
                        field: "git_url".into(),
                        value: "must be empty for a flake source".into(),
                    });
                }
                Ok(())
            }
            SourceType::Image | SourceType::Database => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::build::BuildStatus;
    use crate::domain::deployment::DeploymentStatus;
    use crate::infrastructure::queue::MemoryQueue;
    use crate::infrastructure::store::{BuildStore, DeploymentStore, MemoryStore};

    fn service() -> (SubmissionService, Arc<MemoryStore>, Arc<MemoryQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let service = SubmissionService::new(
            store.clone(),
            queue.clone(),
            BuildValidator::with_default_registry(),
        );
        (service, store, queue)
    }

    fn draft() -> BuildJob {
        let mut job = BuildJob::new("d1", "app1", SourceType::Git);
        job.git_url = "https://example/repo".into();
        job.git_ref = "abc123".into();
        job.build_strategy = "auto-go".into();
        job.build_type = "pure-nix".into();
        job
    }

    #[tokio::test]
    async fn test_submit_persists_and_enqueues() {
        let (service, store, queue) = service();
        let submitted = service.submit(draft()).await.unwrap();

        let stored = store.get_build(&submitted.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Queued);
        assert_eq!(stored.flake_uri, "git+https://example/repo?ref=abc123");

        let deployment = store.get_deployment("d1").await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Pending);

        assert_eq!(queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn test_submit_generates_id_when_absent() {
        let (service, _, _) = service();
        let mut job = draft();
        job.id = String::new();
        let submitted = service.submit(job).await.unwrap();
        assert!(!submitted.id.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_submission_persists_nothing() {
        let (service, store, queue) = service();
        let mut bad = draft();
        bad.build_type = "tarball".into();

        let err = service.submit(bad.clone()).await.unwrap_err();
        let core = err.downcast_ref::<CoreError>().unwrap();
        assert_eq!(core.code(), crate::error::ErrorCode::ValidationFailed);

        assert!(store.get_build(&bad.id).await.unwrap().is_none());
        assert!(store.get_deployment("d1").await.unwrap().is_none());
        assert_eq!(queue.ready_len().await, 0);
    }

    #[tokio::test]
    async fn test_flake_source_must_not_carry_repo_url() {
        let (service, _, _) = service();
        let mut job = draft();
        job.source_type = SourceType::Flake;
        job.flake_uri = "github:acme/svc".into();

        let err = service.submit(job).await.unwrap_err();
        let core = err.downcast_ref::<CoreError>().unwrap();
        assert_eq!(core.code(), crate::error::ErrorCode::InvalidValue);
        assert_eq!(core.field(), Some("git_url"));
    }

    #[tokio::test]
    async fn test_git_source_requires_url() {
        let (service, _, _) = service();
        let mut job = draft();
        job.git_url = String::new();

        let err = service.submit(job).await.unwrap_err();
        let core = err.downcast_ref::<CoreError>().unwrap();
        assert_eq!(core.code(), crate::error::ErrorCode::RequiredField);
    }

    #[tokio::test]
    async fn test_existing_deployment_is_reused() {
        let (service, store, _) = service();
        let mut deployment = Deployment::new("d1", "app1");
        deployment.artifact = "/nix/store/existing-app".into();
        store.create_deployment(deployment).await.unwrap();

        service.submit(draft()).await.unwrap();

        let stored = store.get_deployment("d1").await.unwrap().unwrap();
        assert_eq!(stored.artifact, "/nix/store/existing-app");
    }
}
