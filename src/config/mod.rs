//! Control-plane configuration.
//!
//! Loaded from a YAML file; every section has defaults so a missing or
//! partial file yields a working configuration. Cache TTLs are given in
//! humantime form ("30m", "24h"); "0" means entries never expire.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::build::BuildStrategy;

/// Humantime-encoded durations in the config file.
mod ttl {
    use super::*;
    use serde::de::Error;
    use serde::{Deserializer, Serializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.trim() == "0" {
            return Ok(Duration::ZERO);
        }
        humantime::parse_duration(raw.trim()).map_err(D::Error::custom)
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Build cache section
    #[serde(default)]
    pub build_cache: BuildCacheSettings,

    /// Detection cache section
    #[serde(default)]
    pub detection_cache: DetectionCacheSettings,

    /// Build timeout when neither the job nor its config sets one.
    /// Values <= 0 fall back to 1800 seconds.
    #[serde(default = "default_build_timeout_seconds")]
    pub default_build_timeout_seconds: i64,

    /// Worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Recognized build strategies.
    #[serde(default = "default_strategy_registry")]
    pub strategy_registry: Vec<String>,

    /// Binary cache (closure push) section
    #[serde(default)]
    pub binary_cache: BinaryCacheSettings,

    /// Node-agent endpoint section
    #[serde(default)]
    pub agent: AgentSettings,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            build_cache: BuildCacheSettings::default(),
            detection_cache: DetectionCacheSettings::default(),
            default_build_timeout_seconds: default_build_timeout_seconds(),
            workers: default_workers(),
            strategy_registry: default_strategy_registry(),
            binary_cache: BinaryCacheSettings::default(),
            agent: AgentSettings::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Load from a file when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

/// Build cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCacheSettings {
    /// Entry lifetime; "0" = infinite.
    #[serde(default = "default_build_cache_ttl", with = "ttl")]
    pub ttl: Duration,
}

impl Default for BuildCacheSettings {
    fn default() -> Self {
        Self {
            ttl: default_build_cache_ttl(),
        }
    }
}

/// Detection cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionCacheSettings {
    /// Entry lifetime; "0" = infinite.
    #[serde(default = "default_detection_cache_ttl", with = "ttl")]
    pub ttl: Duration,
}

impl Default for DetectionCacheSettings {
    fn default() -> Self {
        Self {
            ttl: default_detection_cache_ttl(),
        }
    }
}

/// Binary cache settings for closure pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryCacheSettings {
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    #[serde(default = "default_cache_server")]
    pub server_url: String,
}

impl Default for BinaryCacheSettings {
    fn default() -> Self {
        Self {
            cache_name: default_cache_name(),
            server_url: default_cache_server(),
        }
    }
}

/// Node-agent endpoint settings. An empty base URL disables deploy-command
/// emission.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentSettings {
    #[serde(default)]
    pub base_url: String,

    #[serde(default = "default_agent_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl AgentSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

fn default_build_timeout_seconds() -> i64 {
    1800
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_strategy_registry() -> Vec<String> {
    BuildStrategy::ALL
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn default_build_cache_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_detection_cache_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_cache_name() -> String {
    "cache".to_string()
}

fn default_cache_server() -> String {
    "http://localhost:8080".to_string()
}

fn default_agent_timeout_seconds() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControlPlaneConfig::default();
        assert_eq!(config.default_build_timeout_seconds, 1800);
        assert!(config.workers >= 1);
        assert_eq!(config.build_cache.ttl, Duration::from_secs(86400));
        assert_eq!(config.detection_cache.ttl, Duration::from_secs(3600));
        assert!(config.strategy_registry.contains(&"auto-go".to_string()));
        assert!(config.agent.base_url.is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let yaml = r#"
build_cache:
  ttl: 12h
detection_cache:
  ttl: 30m
default_build_timeout_seconds: 600
workers: 8
strategy_registry: [flake, auto-go]
binary_cache:
  cache_name: prod
  server_url: http://cache.internal:8080
agent:
  base_url: http://agent.internal:9000
  timeout_seconds: 10
"#;
        let config: ControlPlaneConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.build_cache.ttl, Duration::from_secs(12 * 3600));
        assert_eq!(config.detection_cache.ttl, Duration::from_secs(1800));
        assert_eq!(config.default_build_timeout_seconds, 600);
        assert_eq!(config.workers, 8);
        assert_eq!(config.strategy_registry, vec!["flake", "auto-go"]);
        assert_eq!(config.binary_cache.cache_name, "prod");
        assert_eq!(config.agent.base_url, "http://agent.internal:9000");
        assert_eq!(config.agent.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_ttl_means_infinite() {
        let yaml = "build_cache:\n  ttl: \"0\"\n";
        let config: ControlPlaneConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.build_cache.ttl, Duration::ZERO);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let yaml = "workers: 2\n";
        let config: ControlPlaneConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.default_build_timeout_seconds, 1800);
        assert_eq!(config.build_cache.ttl, Duration::from_secs(86400));
    }

    #[test]
    fn test_ttl_round_trip() {
        let config = ControlPlaneConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: ControlPlaneConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.build_cache.ttl, config.build_cache.ttl);
    }
}
