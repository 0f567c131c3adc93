//! Config merging: detected defaults under user-supplied values.
//!
//! Precedence is strict and field-wise: a non-empty user value wins,
//! otherwise the detected value, otherwise the field stays empty. The
//! tri-state `enable_cgo` uses `None` (not `false`) as "user didn't
//! specify", and the integer timeout uses zero as unset.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use crate::domain::build::BuildConfig;

/// Fallback build timeout when neither the job, its config, nor the
/// operator configuration specifies one.
pub const FALLBACK_TIMEOUT_SECONDS: i64 = 1800;

/// Overlay a user config on detected defaults.
///
/// `merge(None, None)` yields an empty config.
pub fn merge(
    detected: Option<&BTreeMap<String, String>>,
    user: Option<&BuildConfig>,
) -> BuildConfig {
    let mut effective = BuildConfig::default();

    if let Some(detected) = detected {
        for (key, value) in detected {
            apply_detected(&mut effective, key, value);
        }
    }

    if let Some(user) = user {
        overlay_string(&mut effective.go_version, &user.go_version);
        overlay_string(&mut effective.node_version, &user.node_version);
        overlay_string(&mut effective.python_version, &user.python_version);
        overlay_string(&mut effective.rust_version, &user.rust_version);
        overlay_string(&mut effective.build_command, &user.build_command);
        overlay_string(&mut effective.install_command, &user.install_command);
        overlay_string(&mut effective.start_command, &user.start_command);
        overlay_string(&mut effective.entry_point, &user.entry_point);

        if user.enable_cgo.is_some() {
            effective.enable_cgo = user.enable_cgo;
        }
        if user.build_timeout > 0 {
            effective.build_timeout = user.build_timeout;
        }
        // Env merges key-wise; user keys override detected keys.
        for (key, value) in &user.env {
            effective.env.insert(key.clone(), value.clone());
        }
    }

    effective
}

fn overlay_string(target: &mut String, user: &str) {
    if !user.is_empty() {
        *target = user.to_string();
    }
}

fn apply_detected(config: &mut BuildConfig, key: &str, value: &str) {
    match key {
        "go_version" => config.go_version = value.to_string(),
        "node_version" => config.node_version = value.to_string(),
        "python_version" => config.python_version = value.to_string(),
        "rust_version" => config.rust_version = value.to_string(),
        "build_command" => config.build_command = value.to_string(),
        "install_command" => config.install_command = value.to_string(),
        "start_command" => config.start_command = value.to_string(),
        "entry_point" => config.entry_point = value.to_string(),
        "enable_cgo" => config.enable_cgo = Some(value == "true"),
        "build_timeout" => config.build_timeout = value.parse().unwrap_or(0),
        other => {
            debug!(key = %other, "ignoring unknown detected config key");
        }
    }
}

/// Derive the effective build timeout:
/// `job.timeout_seconds` if positive, else the config's `build_timeout` if
/// positive, else the operator default if positive, else 1800 seconds.
/// Negative job timeouts are treated as unset.
pub fn effective_timeout(
    job_timeout_seconds: i64,
    config: Option<&BuildConfig>,
    default_timeout_seconds: i64,
) -> Duration {
    let seconds = if job_timeout_seconds > 0 {
        job_timeout_seconds
    } else if let Some(config_timeout) = config.map(|c| c.build_timeout as i64).filter(|t| *t > 0) {
        config_timeout
    } else if default_timeout_seconds > 0 {
        default_timeout_seconds
    } else {
        FALLBACK_TIMEOUT_SECONDS
    };
    Duration::from_secs(seconds as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detected() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("go_version".to_string(), "1.22".to_string()),
            ("build_command".to_string(), "go build ./...".to_string()),
            ("entry_point".to_string(), "cmd/api".to_string()),
            ("enable_cgo".to_string(), "true".to_string()),
        ])
    }

    #[test]
    fn test_merge_nothing_yields_empty_config() {
        assert_eq!(merge(None, None), BuildConfig::default());
    }

    #[test]
    fn test_detected_fills_unset_fields() {
        let effective = merge(Some(&detected()), None);
        assert_eq!(effective.go_version, "1.22");
        assert_eq!(effective.build_command, "go build ./...");
        assert_eq!(effective.entry_point, "cmd/api");
        assert_eq!(effective.enable_cgo, Some(true));
        assert!(effective.node_version.is_empty());
    }

    #[test]
    fn test_user_overrides_detected_field_wise() {
        let user = BuildConfig {
            go_version: "1.23".into(),
            entry_point: String::new(),
            ..Default::default()
        };
        let effective = merge(Some(&detected()), Some(&user));

        // User-supplied value wins.
        assert_eq!(effective.go_version, "1.23");
        // Empty user field falls back to detected.
        assert_eq!(effective.entry_point, "cmd/api");
        assert_eq!(effective.build_command, "go build ./...");
    }

    #[test]
    fn test_tri_state_boolean_unset_keeps_detected() {
        let user = BuildConfig::default();
        assert_eq!(user.enable_cgo, None);

        let effective = merge(Some(&detected()), Some(&user));
        assert_eq!(effective.enable_cgo, Some(true));

        let user = BuildConfig {
            enable_cgo: Some(false),
            ..Default::default()
        };
        let effective = merge(Some(&detected()), Some(&user));
        // An explicit false is a user choice, not "unset".
        assert_eq!(effective.enable_cgo, Some(false));
    }

    #[test]
    fn test_env_merges_key_wise() {
        let mut map = detected();
        map.insert("unknown_key".into(), "ignored".into());

        let user = BuildConfig {
            env: BTreeMap::from([("PORT".to_string(), "8080".to_string())]),
            ..Default::default()
        };
        let effective = merge(Some(&map), Some(&user));
        assert_eq!(effective.env.get("PORT").unwrap(), "8080");
        assert!(!effective.env.contains_key("unknown_key"));
    }

    #[test]
    fn test_effective_timeout_precedence() {
        let config = BuildConfig {
            build_timeout: 600,
            ..Default::default()
        };

        // Job timeout wins.
        assert_eq!(
            effective_timeout(120, Some(&config), 900),
            Duration::from_secs(120)
        );
        // Config timeout next.
        assert_eq!(
            effective_timeout(0, Some(&config), 900),
            Duration::from_secs(600)
        );
        // Operator default next.
        assert_eq!(effective_timeout(0, None, 900), Duration::from_secs(900));
        // Hard fallback last.
        assert_eq!(effective_timeout(0, None, 0), Duration::from_secs(1800));
    }

    #[test]
    fn test_negative_and_zero_treated_as_unset() {
        assert_eq!(effective_timeout(-5, None, 0), Duration::from_secs(1800));

        let config = BuildConfig {
            build_timeout: 0,
            ..Default::default()
        };
        assert_eq!(
            effective_timeout(0, Some(&config), -1),
            Duration::from_secs(1800)
        );
    }
}
