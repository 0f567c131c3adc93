//! Deployment record and node-agent boundary types.
//!
//! The core only transitions a deployment `pending -> building -> built|failed`;
//! downstream statuses belong to the scheduler and arrive via node-agent
//! status reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::build::BuildStatus;

/// Full deployment status set. The build core writes only the first four;
/// the rest are reported back by the scheduler and node agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Built,
    Scheduled,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Built => "built",
            Self::Scheduled => "scheduled",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Pending,
            Self::Building,
            Self::Built,
            Self::Scheduled,
            Self::Starting,
            Self::Running,
            Self::Stopping,
            Self::Stopped,
            Self::Failed,
        ]
        .into_iter()
        .find(|v| v.as_str() == s)
    }

    /// The deployment status a build status maps onto.
    pub fn from_build_status(status: BuildStatus) -> Self {
        match status {
            BuildStatus::Queued => Self::Pending,
            BuildStatus::Running => Self::Building,
            BuildStatus::Succeeded => Self::Built,
            BuildStatus::Failed => Self::Failed,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub app_id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build_type: String,
    /// Store path or OCI tag of the last successful build. Never written
    /// on failure; a failed build preserves the previous value.
    #[serde(default)]
    pub artifact: String,
    pub status: DeploymentStatus,
    /// Last human-relevant message: validation error list, node-agent
    /// report message, and the like.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn new(id: impl Into<String>, app_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            app_id: app_id.into(),
            service_name: String::new(),
            version: String::new(),
            build_type: String::new(),
            artifact: String::new(),
            status: DeploymentStatus::Pending,
            status_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
        }
    }
}

/// Runtime configuration shipped with a deploy command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Resource spec, e.g. `cpu` / `memory` requests.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

/// HTTP health-check probe definition for the node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    pub port: u16,
    #[serde(default)]
    pub interval_seconds: u64,
}

/// Command handed to a node agent after a successful build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployCommand {
    pub deployment_id: String,
    pub artifact: String,
    pub build_type: String,
    pub runtime_config: RuntimeConfig,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

/// Per-deployment status reported back by a node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusReport {
    pub deployment_id: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
