//! Pre-execution validation of submitted build jobs.
//!
//! Validation is pure and collecting: every check runs, every failure is
//! reported, nothing short-circuits. It runs before any build work; a job
//! that fails validation never reaches `running`.

use crate::domain::build::{BuildJob, BuildStrategy, BuildType, SourceType};
use crate::error::ValidationError;

/// Outcome of validating one job.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_findings(errors: Vec<ValidationError>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Validates jobs against the configured strategy registry.
pub struct BuildValidator {
    strategies: Vec<String>,
}

impl BuildValidator {
    pub fn new(strategies: Vec<String>) -> Self {
        Self { strategies }
    }

    /// A validator recognizing every built-in strategy.
    pub fn with_default_registry() -> Self {
        Self::new(
            BuildStrategy::ALL
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
        )
    }

    pub fn validate(&self, job: &BuildJob) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if job.id.is_empty() {
            errors.push(ValidationError::required("id"));
        }
        if job.deployment_id.is_empty() {
            errors.push(ValidationError::required("deployment_id"));
        }

        if job.build_type.is_empty() {
            errors.push(ValidationError::required("build_type"));
        } else if BuildType::parse(&job.build_type).is_none() {
            errors.push(ValidationError::invalid("build_type", &job.build_type));
        }

        if !job.build_strategy.is_empty()
            && !self.strategies.iter().any(|s| s == &job.build_strategy)
        {
            errors.push(ValidationError::invalid(
                "build_strategy",
                &job.build_strategy,
            ));
        }

        if job.timeout_seconds < 0 {
            errors.push(ValidationError::negative(
                "timeout_seconds",
                job.timeout_seconds,
            ));
        }

        // Source-shape irregularities are surfaced as warnings; the source
        // consistency invariant is enforced at submission time.
        match job.source_type {
            SourceType::Git => {
                if job.git_url.is_empty() {
                    warnings.push("git source without a repository URL".into());
                }
                if job.git_ref.is_empty() {
                    warnings.push("git source without a pinned ref; detection cannot be cached".into());
                }
            }
            SourceType::Flake => {
                if job.flake_uri.is_empty() {
                    warnings.push("flake source without a recipe URI".into());
                }
                if !job.git_url.is_empty() {
                    warnings.push("flake source carries a repository URL; it will be ignored".into());
                }
            }
            SourceType::Image | SourceType::Database => {}
        }

        if job.build_strategy.is_empty() {
            warnings.push("no build strategy; detection will choose one".into());
        }

        ValidationReport::from_findings(errors, warnings)
    }
}
