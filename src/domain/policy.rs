//! Strategy / build-type policy.
//!
//! Two fixed rules: which build type a strategy is allowed to produce, and
//! what shape an artifact string must have for a given build type.

use std::sync::OnceLock;

use regex::Regex;

use super::build::{BuildStrategy, BuildType};
use crate::error::CoreError;

/// Store paths are `/nix/store/<hash>-<name>` where the hash is at least 32
/// characters of the nix base32 alphabet.
fn store_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^/nix/store/[0123456789abcdfghijklmnpqrsvwxyz]{32,}-\S+$")
            .unwrap_or_else(|e| panic!("invalid store path pattern: {}", e))
    })
}

/// Resolve the effective build type for a strategy.
///
/// Returns `(effective, overridden)` where `overridden` is true when the
/// request was forced to something else:
/// - `dockerfile` and `nixpacks` always produce `oci`;
/// - `flake` honors the request;
/// - auto-* (and an absent strategy) default to `pure-nix` when the request
///   is empty.
pub fn enforce_build_type(strategy: Option<BuildStrategy>, requested: &str) -> (BuildType, bool) {
    let parsed = BuildType::parse(requested);
    match strategy {
        Some(s) if s.forces_oci() => (BuildType::Oci, parsed != Some(BuildType::Oci)),
        Some(BuildStrategy::Flake) => (parsed.unwrap_or(BuildType::PureNix), false),
        _ => match parsed {
            Some(t) => (t, false),
            None => (BuildType::PureNix, false),
        },
    }
}

/// Check that an artifact string has the right shape for its build type.
///
/// Pure builds accept only content-addressed store paths; OCI builds accept
/// tag-like (`:`) or digest-like (`@`) references that are not store paths.
pub fn validate_artifact(build_type: BuildType, artifact: &str) -> Result<(), CoreError> {
    if artifact.is_empty() {
        return Err(CoreError::EmptyArtifact);
    }
    match build_type {
        BuildType::PureNix => {
            if store_path_pattern().is_match(artifact) {
                Ok(())
            } else {
                Err(CoreError::InvalidValue {
                    field: "artifact".into(),
                    value: format!("{} is not a store path", artifact),
                })
            }
        }
        BuildType::Oci => {
            let tag_or_digest = artifact.contains(':') || artifact.contains('@');
            if tag_or_digest && !artifact.starts_with("/nix/store/") {
                Ok(())
            } else {
                Err(CoreError::InvalidValue {
                    field: "artifact".into(),
                    value: format!("{} is not an image tag or digest", artifact),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORE_PATH: &str =
        "/nix/store/0c0fnkjpa1pcy9zbf9wlkcjmccqy0q6k-app-1.2.3";

    #[test]
    fn test_dockerfile_forces_oci() {
        let (effective, overridden) =
            enforce_build_type(Some(BuildStrategy::Dockerfile), "pure-nix");
        assert_eq!(effective, BuildType::Oci);
        assert!(overridden);

        let (effective, overridden) = enforce_build_type(Some(BuildStrategy::Nixpacks), "oci");
        assert_eq!(effective, BuildType::Oci);
        assert!(!overridden);
    }

    #[test]
    fn test_flake_honors_request() {
        let (effective, overridden) = enforce_build_type(Some(BuildStrategy::Flake), "oci");
        assert_eq!(effective, BuildType::Oci);
        assert!(!overridden);

        let (effective, overridden) = enforce_build_type(Some(BuildStrategy::Flake), "pure-nix");
        assert_eq!(effective, BuildType::PureNix);
        assert!(!overridden);
    }

    #[test]
    fn test_auto_defaults_to_pure() {
        let (effective, overridden) = enforce_build_type(Some(BuildStrategy::AutoGo), "");
        assert_eq!(effective, BuildType::PureNix);
        assert!(!overridden);

        let (effective, overridden) = enforce_build_type(Some(BuildStrategy::AutoRust), "oci");
        assert_eq!(effective, BuildType::Oci);
        assert!(!overridden);

        let (effective, overridden) = enforce_build_type(None, "");
        assert_eq!(effective, BuildType::PureNix);
        assert!(!overridden);
    }

    #[test]
    fn test_store_path_accepted_for_pure() {
        assert!(validate_artifact(BuildType::PureNix, STORE_PATH).is_ok());
    }

    #[test]
    fn test_pure_rejects_oci_shapes() {
        assert!(validate_artifact(BuildType::PureNix, "registry.example/app:v1").is_err());
        assert!(validate_artifact(BuildType::PureNix, "/nix/store/short-app").is_err());
        assert!(validate_artifact(BuildType::PureNix, "/nix/store/").is_err());
    }

    #[test]
    fn test_oci_accepts_tags_and_digests() {
        assert!(validate_artifact(BuildType::Oci, "registry.example/app:v1").is_ok());
        assert!(validate_artifact(BuildType::Oci, "registry.example/app@sha256:abcd").is_ok());
    }

    #[test]
    fn test_oci_rejects_store_paths_and_bare_names() {
        assert!(validate_artifact(BuildType::Oci, STORE_PATH).is_err());
        assert!(validate_artifact(BuildType::Oci, "just-a-name").is_err());
    }

    #[test]
    fn test_empty_artifact_rejected() {
        let err = validate_artifact(BuildType::Oci, "").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::EmptyArtifact);
    }
}
