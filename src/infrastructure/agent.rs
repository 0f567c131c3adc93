//! Node-agent client.
//!
//! After a successful build the control plane hands a deploy command to
//! the node agent responsible for the deployment; agents report
//! per-deployment status back over the same boundary. If no agent
//! endpoint is configured, command emission is disabled and all sends are
//! no-ops.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::{debug, warn};

use crate::domain::deployment::DeployCommand;

/// HTTP client for a node-agent endpoint.
pub struct NodeAgentClient {
    client: Client,
    base_url: String,
}

impl NodeAgentClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build node-agent HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Hand a deploy command to the agent.
    pub async fn send_deploy_command(&self, command: &DeployCommand) -> Result<()> {
        let url = format!(
            "{}/api/deployments/{}/deploy",
            self.base_url, command.deployment_id
        );

        let response = self
            .client
            .post(&url)
            .json(command)
            .send()
            .await
            .context("Failed to send deploy command")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Deploy command failed with status {}: {}", status, body);
        }

        Ok(())
    }

    /// Health check.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send health check request")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Node agent health check failed with status {}",
                response.status()
            );
        }

        Ok(())
    }
}

/// Optional wrapper: a gateway with no configured endpoint swallows sends.
pub struct AgentGateway {
    client: Option<NodeAgentClient>,
}

impl AgentGateway {
    pub fn new(client: Option<NodeAgentClient>) -> Self {
        Self { client }
    }

    pub fn disabled() -> Self {
        Self { client: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Send a deploy command, best effort: failures are logged, never
    /// propagated into the build lifecycle.
    pub async fn send_deploy_command(&self, command: &DeployCommand) {
        if let Some(client) = &self.client {
            match client.send_deploy_command(command).await {
                Ok(()) => {
                    debug!(deployment_id = %command.deployment_id, "deploy command sent to node agent");
                }
                Err(e) => {
                    warn!(
                        deployment_id = %command.deployment_id,
                        error = %e,
                        "failed to send deploy command"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_gateway() {
        let gateway = AgentGateway::disabled();
        assert!(!gateway.is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_gateway_send_is_a_no_op() {
        let gateway = AgentGateway::disabled();
        let command = DeployCommand {
            deployment_id: "d1".into(),
            artifact: "/nix/store/abc-app".into(),
            build_type: "pure-nix".into(),
            runtime_config: Default::default(),
            secrets: Default::default(),
        };
        // Nothing to assert beyond "does not panic or block".
        gateway.send_deploy_command(&command).await;
    }

    #[test]
    fn test_client_construction() {
        let client = NodeAgentClient::new("http://agent.internal:9000", Duration::from_secs(30))
            .unwrap();
        assert_eq!(client.base_url(), "http://agent.internal:9000");
    }
}
