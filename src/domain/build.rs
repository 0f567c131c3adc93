//! Build job model and lifecycle state machine.
//!
//! A build job is the authoritative record of one build: its source, its
//! strategy, its lifecycle status, and its controls. The state machine here
//! is the single source of truth for which status transitions are legal;
//! persistence refuses any update that is not in the table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// How a build produces its artifact.
///
/// Carried on the job record as a string (the recognized set is
/// configuration); parsed into this enum after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStrategy {
    /// Use an existing flake recipe as-is.
    Flake,
    /// Synthesize a reproducible recipe for a Go module.
    AutoGo,
    /// Synthesize a reproducible recipe for a Rust package.
    AutoRust,
    /// Synthesize a reproducible recipe for a Node package.
    AutoNode,
    /// Synthesize a reproducible recipe for a Python application.
    AutoPython,
    /// Synthesize a managed database template.
    AutoDatabase,
    /// Build from a Dockerfile.
    Dockerfile,
    /// Build with nixpacks.
    Nixpacks,
    /// Detect the strategy from the source tree.
    Auto,
}

impl BuildStrategy {
    /// Every strategy the core knows about, in registry order.
    pub const ALL: [BuildStrategy; 9] = [
        Self::Flake,
        Self::AutoGo,
        Self::AutoRust,
        Self::AutoNode,
        Self::AutoPython,
        Self::AutoDatabase,
        Self::Dockerfile,
        Self::Nixpacks,
        Self::Auto,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flake => "flake",
            Self::AutoGo => "auto-go",
            Self::AutoRust => "auto-rust",
            Self::AutoNode => "auto-node",
            Self::AutoPython => "auto-python",
            Self::AutoDatabase => "auto-database",
            Self::Dockerfile => "dockerfile",
            Self::Nixpacks => "nixpacks",
            Self::Auto => "auto",
        }
    }

    /// Parse a wire-form strategy name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }

    /// Strategies that synthesize a recipe from the source tree.
    pub fn is_synthesized(&self) -> bool {
        matches!(
            self,
            Self::AutoGo | Self::AutoRust | Self::AutoNode | Self::AutoPython | Self::AutoDatabase
        )
    }

    /// Whether this strategy needs a detection pass before building.
    pub fn requires_detection(&self) -> bool {
        matches!(self, Self::Auto)
    }

    /// Strategies that always produce a container image.
    pub fn forces_oci(&self) -> bool {
        matches!(self, Self::Dockerfile | Self::Nixpacks)
    }
}

impl std::fmt::Display for BuildStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the produced artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildType {
    /// Content-addressed store path from a declarative pure build.
    PureNix,
    /// OCI image tag.
    Oci,
}

impl BuildType {
    pub const ALL: [BuildType; 2] = [Self::PureNix, Self::Oci];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PureNix => "pure-nix",
            Self::Oci => "oci",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }
}

impl std::fmt::Display for BuildType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the build's source comes from.
///
/// A job has exactly one source consistent with this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    /// Version-controlled repository; requires repo URL and ref.
    Git,
    /// Direct recipe URI; repo URL must be empty.
    Flake,
    /// Prebuilt container image.
    Image,
    /// Managed database template + version.
    Database,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Flake => "flake",
            Self::Image => "image",
            Self::Database => "database",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table.
///
/// | from    | to        | when                                   |
/// |---------|-----------|----------------------------------------|
/// | queued  | running   | worker picks up the job                |
/// | queued  | failed    | pre-execution validation fails         |
/// | running | succeeded | driver (and push, for pure) succeed    |
/// | running | failed    | driver, push, or timeout fails         |
/// | running | queued    | only with the retry flag               |
///
/// Terminal states reject everything, including self-transitions and
/// retry-flagged attempts.
pub fn can_transition(from: BuildStatus, to: BuildStatus, is_retry: bool) -> bool {
    use BuildStatus::*;
    match (from, to) {
        (Queued, Running) => true,
        (Queued, Failed) => true,
        (Running, Succeeded) => true,
        (Running, Failed) => true,
        (Running, Queued) => is_retry,
        _ => false,
    }
}

/// Check a transition, returning the typed error on an illegal one.
pub fn check_transition(
    from: BuildStatus,
    to: BuildStatus,
    is_retry: bool,
) -> Result<(), CoreError> {
    if can_transition(from, to, is_retry) {
        Ok(())
    } else {
        Err(CoreError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// One entry of the append-only per-job transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub build_id: String,
    pub from: BuildStatus,
    pub to: BuildStatus,
    pub timestamp: DateTime<Utc>,
}

/// Language-aware build configuration supplied by the user or synthesized
/// from detection. Empty strings and zero mean "unset"; tri-state booleans
/// use `None` as "user didn't specify".
///
/// `env` is a BTreeMap so the canonical JSON form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub go_version: String,
    #[serde(default)]
    pub node_version: String,
    #[serde(default)]
    pub python_version: String,
    #[serde(default)]
    pub rust_version: String,
    #[serde(default)]
    pub build_command: String,
    #[serde(default)]
    pub install_command: String,
    #[serde(default)]
    pub start_command: String,
    #[serde(default)]
    pub entry_point: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_cgo: Option<bool>,
    /// Build timeout in seconds; 0 means unset.
    #[serde(default)]
    pub build_timeout: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl BuildConfig {
    /// Canonical JSON form used for fingerprint hashing. Field order is
    /// fixed by the struct definition and `env` is sorted, so the output
    /// is byte-stable across process instances.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Output of the external build driver.
///
/// Exactly one of `store_path` or `image_tag` is populated, consistent with
/// the build type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl BuildResult {
    pub fn pure(store_path: impl Into<String>) -> Self {
        let store_path = store_path.into();
        Self {
            artifact: store_path.clone(),
            store_path: Some(store_path),
            image_tag: None,
            logs: Vec::new(),
        }
    }

    pub fn oci(image_tag: impl Into<String>) -> Self {
        let image_tag = image_tag.into();
        Self {
            artifact: image_tag.clone(),
            store_path: None,
            image_tag: Some(image_tag),
            logs: Vec::new(),
        }
    }

    /// A result with no artifact and neither output shape carries nothing.
    pub fn is_empty(&self) -> bool {
        self.artifact.is_empty() && self.store_path.is_none() && self.image_tag.is_none()
    }

    /// Derive the build type from the result shape: a store path means a
    /// pure build, an image tag means an OCI build.
    pub fn derived_build_type(&self) -> Option<BuildType> {
        if self.store_path.is_some() || self.artifact.starts_with("/nix/store/") {
            Some(BuildType::PureNix)
        } else if self.image_tag.is_some()
            || self.artifact.contains(':')
            || self.artifact.contains('@')
        {
            Some(BuildType::Oci)
        } else {
            None
        }
    }
}

fn default_status() -> BuildStatus {
    BuildStatus::Queued
}

/// Authoritative record of one build job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    // Identity
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    // Source
    pub source_type: SourceType,
    #[serde(default)]
    pub git_url: String,
    #[serde(default)]
    pub git_ref: String,
    #[serde(default)]
    pub flake_uri: String,
    #[serde(default)]
    pub flake_output: String,

    // Strategy
    #[serde(default)]
    pub build_strategy: String,
    #[serde(default)]
    pub build_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_config: Option<BuildConfig>,
    #[serde(default)]
    pub vendor_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_recipe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_file: Option<String>,

    // Lifecycle
    #[serde(default = "default_status")]
    pub status: BuildStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    // Outcome
    #[serde(default)]
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    // Controls
    /// Job-level timeout in seconds; 0 or negative means unset.
    #[serde(default)]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_as_oci: bool,
}

impl BuildJob {
    /// Create a queued job with a generated id.
    pub fn new(
        deployment_id: impl Into<String>,
        app_id: impl Into<String>,
        source_type: SourceType,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            deployment_id: deployment_id.into(),
            app_id: app_id.into(),
            service_name: None,
            source_type,
            git_url: String::new(),
            git_ref: String::new(),
            flake_uri: String::new(),
            flake_output: String::new(),
            build_strategy: String::new(),
            build_type: String::new(),
            build_config: None,
            vendor_hash: String::new(),
            generated_recipe: None,
            lock_file: None,
            status: BuildStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            artifact: String::new(),
            error: None,
            timeout_seconds: 0,
            retry_count: 0,
            retry_as_oci: false,
        }
    }

    /// Typed view of the strategy string, when it parses.
    pub fn strategy(&self) -> Option<BuildStrategy> {
        BuildStrategy::parse(&self.build_strategy)
    }

    /// Typed view of the build-type string, when it parses.
    pub fn requested_build_type(&self) -> Option<BuildType> {
        BuildType::parse(&self.build_type)
    }

    /// The key under which this job's cache entries are grouped for
    /// service-level invalidation.
    pub fn service_key(&self) -> String {
        match &self.service_name {
            Some(name) if !name.is_empty() => format!("{}/{}", self.app_id, name),
            _ => self.app_id.clone(),
        }
    }

    /// Derive the recipe URI for a git source: `git+<url>?ref=<ref>`.
    pub fn derive_flake_uri(&self) -> String {
        if self.git_ref.is_empty() {
            format!("git+{}", self.git_url)
        } else {
            format!("git+{}?ref={}", self.git_url, self.git_ref)
        }
    }

    /// Whether this job needs a source checkout before building.
    pub fn needs_checkout(&self) -> bool {
        matches!(self.source_type, SourceType::Git)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_exact() {
        use BuildStatus::*;
        let all = [Queued, Running, Succeeded, Failed];
        for from in all {
            for to in all {
                for is_retry in [false, true] {
                    let expected = matches!(
                        (from, to),
                        (Queued, Running)
                            | (Queued, Failed)
                            | (Running, Succeeded)
                            | (Running, Failed)
                    ) || (from == Running && to == Queued && is_retry);
                    assert_eq!(
                        can_transition(from, to, is_retry),
                        expected,
                        "{} -> {} (retry={})",
                        from,
                        to,
                        is_retry
                    );
                }
            }
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        use BuildStatus::*;
        for from in [Succeeded, Failed] {
            for to in [Queued, Running, Succeeded, Failed] {
                assert!(!can_transition(from, to, false));
                assert!(!can_transition(from, to, true));
            }
        }
    }

    #[test]
    fn test_retry_carve_out() {
        assert!(can_transition(BuildStatus::Running, BuildStatus::Queued, true));
        assert!(!can_transition(BuildStatus::Running, BuildStatus::Queued, false));
    }

    #[test]
    fn test_check_transition_error_code() {
        let err = check_transition(BuildStatus::Succeeded, BuildStatus::Running, false)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidStateTransition);
    }

    #[test]
    fn test_strategy_parse_round_trip() {
        for strategy in BuildStrategy::ALL {
            assert_eq!(BuildStrategy::parse(strategy.as_str()), Some(strategy));
        }
        assert_eq!(BuildStrategy::parse("make"), None);
        assert_eq!(BuildStrategy::parse(""), None);
    }

    #[test]
    fn test_strategy_families() {
        assert!(BuildStrategy::AutoGo.is_synthesized());
        assert!(!BuildStrategy::Flake.is_synthesized());
        assert!(BuildStrategy::Auto.requires_detection());
        assert!(BuildStrategy::Dockerfile.forces_oci());
        assert!(BuildStrategy::Nixpacks.forces_oci());
        assert!(!BuildStrategy::AutoRust.forces_oci());
    }

    #[test]
    fn test_build_result_shape_derivation() {
        let pure = BuildResult::pure("/nix/store/abc123-app");
        assert_eq!(pure.derived_build_type(), Some(BuildType::PureNix));

        let oci = BuildResult::oci("registry.example/app:v1");
        assert_eq!(oci.derived_build_type(), Some(BuildType::Oci));

        let empty = BuildResult::default();
        assert!(empty.is_empty());
        assert_eq!(empty.derived_build_type(), None);
    }

    #[test]
    fn test_service_key() {
        let mut job = BuildJob::new("d1", "app1", SourceType::Git);
        assert_eq!(job.service_key(), "app1");

        job.service_name = Some("api".into());
        assert_eq!(job.service_key(), "app1/api");

        job.service_name = Some(String::new());
        assert_eq!(job.service_key(), "app1");
    }

    #[test]
    fn test_derive_flake_uri() {
        let mut job = BuildJob::new("d1", "app1", SourceType::Git);
        job.git_url = "https://example/repo".into();
        job.git_ref = "abc123".into();
        assert_eq!(job.derive_flake_uri(), "git+https://example/repo?ref=abc123");

        job.git_ref.clear();
        assert_eq!(job.derive_flake_uri(), "git+https://example/repo");
    }

    #[test]
    fn test_build_config_canonical_json_is_stable() {
        let mut a = BuildConfig::default();
        a.env.insert("B".into(), "2".into());
        a.env.insert("A".into(), "1".into());

        let mut b = BuildConfig::default();
        b.env.insert("A".into(), "1".into());
        b.env.insert("B".into(), "2".into());

        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn test_job_serde_round_trip() {
        let mut job = BuildJob::new("d1", "app1", SourceType::Git);
        job.git_url = "https://example/repo".into();
        job.build_strategy = "auto-go".into();
        job.build_type = "pure-nix".into();

        let json = serde_json::to_string(&job).unwrap();
        let back: BuildJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
        assert!(json.contains("\"source_type\":\"git\""));
        assert!(json.contains("\"status\":\"queued\""));
    }
}
