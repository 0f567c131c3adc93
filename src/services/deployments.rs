//! Deployment-side operations: deploy-command construction and node-agent
//! status report ingestion.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::deployment::{
    AgentStatusReport, DeployCommand, Deployment, DeploymentStatus, RuntimeConfig,
};
use crate::error::CoreError;
use crate::infrastructure::store::ControlPlaneStore;

/// Build the command handed to a node agent for a built deployment.
///
/// The command must carry a non-empty artifact; the runtime config is
/// required by construction.
pub fn build_deploy_command(
    deployment: &Deployment,
    runtime_config: RuntimeConfig,
    secrets: BTreeMap<String, String>,
) -> Result<DeployCommand, CoreError> {
    if deployment.artifact.is_empty() {
        return Err(CoreError::EmptyArtifact);
    }
    Ok(DeployCommand {
        deployment_id: deployment.id.clone(),
        artifact: deployment.artifact.clone(),
        build_type: deployment.build_type.clone(),
        runtime_config,
        secrets,
    })
}

/// Applies node-agent status reports to deployment records.
pub struct DeploymentService {
    store: Arc<dyn ControlPlaneStore>,
}

impl DeploymentService {
    pub fn new(store: Arc<dyn ControlPlaneStore>) -> Self {
        Self { store }
    }

    /// Apply a per-deployment status report from a node agent.
    ///
    /// Retries a few times on optimistic-update conflicts; concurrent
    /// writers (the worker's same-round sync) can race this path.
    pub async fn apply_agent_report(
        &self,
        report: &AgentStatusReport,
    ) -> Result<Deployment, CoreError> {
        if report.deployment_id.is_empty() {
            return Err(CoreError::RequiredField {
                field: "deployment_id".into(),
            });
        }
        let status = DeploymentStatus::parse(&report.status).ok_or_else(|| {
            CoreError::InvalidValue {
                field: "status".into(),
                value: report.status.clone(),
            }
        })?;

        let mut attempt = 0;
        loop {
            let mut deployment = self
                .store
                .get_deployment(&report.deployment_id)
                .await
                .map_err(CoreError::from)?
                .ok_or_else(|| CoreError::InvalidValue {
                    field: "deployment_id".into(),
                    value: format!("{} not found", report.deployment_id),
                })?;

            deployment.status = status;
            deployment.status_message = if report.message.is_empty() {
                None
            } else {
                Some(report.message.clone())
            };
            if let Some(started_at) = report.started_at {
                deployment.started_at = Some(started_at);
            }

            match self.store.update_deployment(&deployment).await {
                Ok(written) => {
                    info!(
                        deployment_id = %written.id,
                        status = %written.status,
                        "applied node-agent status report"
                    );
                    return Ok(written);
                }
                Err(e) if attempt < 2 => {
                    attempt += 1;
                    debug!(deployment_id = %report.deployment_id, error = %e, "report apply raced; retrying");
                }
                Err(e) => return Err(CoreError::from(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::{DeploymentStore, MemoryStore};
    use chrono::{TimeZone, Utc};

    fn deployment_with_artifact() -> Deployment {
        let mut deployment = Deployment::new("d7", "app1");
        deployment.artifact = "/nix/store/abc-app".into();
        deployment.build_type = "pure-nix".into();
        deployment
    }

    #[test]
    fn test_deploy_command_carries_artifact_and_config() {
        let command = build_deploy_command(
            &deployment_with_artifact(),
            RuntimeConfig {
                ports: vec![8080],
                ..Default::default()
            },
            BTreeMap::from([("DB_URL".to_string(), "secret".to_string())]),
        )
        .unwrap();

        assert_eq!(command.deployment_id, "d7");
        assert_eq!(command.artifact, "/nix/store/abc-app");
        assert_eq!(command.build_type, "pure-nix");
        assert_eq!(command.runtime_config.ports, vec![8080]);
        assert_eq!(command.secrets.get("DB_URL").unwrap(), "secret");
    }

    #[test]
    fn test_deploy_command_requires_artifact() {
        let empty = Deployment::new("d7", "app1");
        let err =
            build_deploy_command(&empty, RuntimeConfig::default(), BTreeMap::new()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::EmptyArtifact);
    }

    #[tokio::test]
    async fn test_agent_report_updates_status_and_started_at() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_deployment(deployment_with_artifact())
            .await
            .unwrap();
        let service = DeploymentService::new(store.clone());

        let started = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        let written = service
            .apply_agent_report(&AgentStatusReport {
                deployment_id: "d7".into(),
                status: "running".into(),
                message: String::new(),
                started_at: Some(started),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(written.status, DeploymentStatus::Running);
        assert_eq!(written.started_at, Some(started));

        let reloaded = store.get_deployment("d7").await.unwrap().unwrap();
        assert_eq!(reloaded.status, DeploymentStatus::Running);
        assert_eq!(reloaded.started_at, Some(started));
    }

    #[tokio::test]
    async fn test_agent_report_with_message() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_deployment(deployment_with_artifact())
            .await
            .unwrap();
        let service = DeploymentService::new(store.clone());

        let written = service
            .apply_agent_report(&AgentStatusReport {
                deployment_id: "d7".into(),
                status: "failed".into(),
                message: "container crashed".into(),
                started_at: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(written.status_message, Some("container crashed".into()));
    }

    #[tokio::test]
    async fn test_agent_report_rejects_unknown_status() {
        let store = Arc::new(MemoryStore::new());
        let service = DeploymentService::new(store);

        let err = service
            .apply_agent_report(&AgentStatusReport {
                deployment_id: "d7".into(),
                status: "zombied".into(),
                message: String::new(),
                started_at: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidValue);
    }

    #[tokio::test]
    async fn test_agent_report_for_missing_deployment() {
        let store = Arc::new(MemoryStore::new());
        let service = DeploymentService::new(store);

        let err = service
            .apply_agent_report(&AgentStatusReport {
                deployment_id: "missing".into(),
                status: "running".into(),
                message: String::new(),
                started_at: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidValue);
    }
}
