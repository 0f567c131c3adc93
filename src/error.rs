//! Centralized error types for foundry
//!
//! Uses thiserror for typed errors that can be matched on,
//! while still being compatible with anyhow for propagation.
//!
//! Every failure the core surfaces carries exactly one [`ErrorCode`] from
//! the closed set below, plus an optional field name for validation-style
//! failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of stable failure codes surfaced by the core.
///
/// The wire form (`as_str`) is what external consumers match on; the
/// Rust-side enum is what internal code matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RequiredField,
    InvalidValue,
    NegativeValue,
    InvalidStateTransition,
    BuildTimeout,
    ValidationFailed,
    CacheNotFound,
    CacheExpired,
    NilBuildJob,
    EmptyCacheKey,
    NilResult,
    EmptyArtifact,
    EmptyServiceId,
    EmptyRepoUrl,
    EmptyCommitSha,
    NilDetectionResult,
    EntryPointNotFound,
    InvalidEntryPoint,
    UnsupportedLanguage,
}

impl ErrorCode {
    /// Stable wire form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequiredField => "REQUIRED_FIELD",
            Self::InvalidValue => "INVALID_VALUE",
            Self::NegativeValue => "NEGATIVE_VALUE",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::BuildTimeout => "BUILD_TIMEOUT",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::CacheNotFound => "CACHE_NOT_FOUND",
            Self::CacheExpired => "CACHE_EXPIRED",
            Self::NilBuildJob => "NIL_BUILD_JOB",
            Self::EmptyCacheKey => "EMPTY_CACHE_KEY",
            Self::NilResult => "NIL_RESULT",
            Self::EmptyArtifact => "EMPTY_ARTIFACT",
            Self::EmptyServiceId => "EMPTY_SERVICE_ID",
            Self::EmptyRepoUrl => "EMPTY_REPO_URL",
            Self::EmptyCommitSha => "EMPTY_COMMIT_SHA",
            Self::NilDetectionResult => "NIL_DETECTION_RESULT",
            Self::EntryPointNotFound => "ENTRY_POINT_NOT_FOUND",
            Self::InvalidEntryPoint => "INVALID_ENTRY_POINT",
            Self::UnsupportedLanguage => "UNSUPPORTED_LANGUAGE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validation finding: which field, which code, and a human message.
///
/// The validator collects these without short-circuiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub code: ErrorCode,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code,
            message: message.into(),
        }
    }

    pub fn required(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("{} is required", field);
        Self {
            field,
            code: ErrorCode::RequiredField,
            message,
        }
    }

    pub fn invalid(field: impl Into<String>, value: impl std::fmt::Display) -> Self {
        let field = field.into();
        let message = format!("invalid value for {}: {}", field, value);
        Self {
            field,
            code: ErrorCode::InvalidValue,
            message,
        }
    }

    pub fn negative(field: impl Into<String>, value: i64) -> Self {
        let field = field.into();
        let message = format!("{} must not be negative (got {})", field, value);
        Self {
            field,
            code: ErrorCode::NegativeValue,
            message,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.field, self.code, self.message)
    }
}

/// Core lifecycle errors.
///
/// Each variant maps to exactly one [`ErrorCode`] via [`CoreError::code`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("required field missing: {field}")]
    RequiredField { field: String },

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("negative value for {field}: {value}")]
    NegativeValue { field: String, value: i64 },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("build timeout after {seconds}s")]
    BuildTimeout { seconds: u64 },

    #[error("validation failed: {summary}")]
    ValidationFailed {
        summary: String,
        errors: Vec<ValidationError>,
    },

    #[error("cache entry not found for key {key}")]
    CacheNotFound { key: String },

    #[error("cache entry expired for key {key}")]
    CacheExpired { key: String },

    #[error("build job has no identity")]
    NilBuildJob,

    #[error("cache key is empty")]
    EmptyCacheKey,

    #[error("build result carries no artifact data")]
    NilResult,

    #[error("artifact is empty")]
    EmptyArtifact,

    #[error("service id is empty")]
    EmptyServiceId,

    #[error("repository URL is empty")]
    EmptyRepoUrl,

    #[error("commit SHA is empty")]
    EmptyCommitSha,

    #[error("detection result carries no content")]
    NilDetectionResult,

    #[error("entry point not found: {path}")]
    EntryPointNotFound { path: String },

    #[error("invalid entry point: {path}: {reason}")]
    InvalidEntryPoint { path: String, reason: String },

    #[error("unsupported language: {language}")]
    UnsupportedLanguage { language: String },
}

impl CoreError {
    /// The stable code this failure maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RequiredField { .. } => ErrorCode::RequiredField,
            Self::InvalidValue { .. } => ErrorCode::InvalidValue,
            Self::NegativeValue { .. } => ErrorCode::NegativeValue,
            Self::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::BuildTimeout { .. } => ErrorCode::BuildTimeout,
            Self::ValidationFailed { .. } => ErrorCode::ValidationFailed,
            Self::CacheNotFound { .. } => ErrorCode::CacheNotFound,
            Self::CacheExpired { .. } => ErrorCode::CacheExpired,
            Self::NilBuildJob => ErrorCode::NilBuildJob,
            Self::EmptyCacheKey => ErrorCode::EmptyCacheKey,
            Self::NilResult => ErrorCode::NilResult,
            Self::EmptyArtifact => ErrorCode::EmptyArtifact,
            Self::EmptyServiceId => ErrorCode::EmptyServiceId,
            Self::EmptyRepoUrl => ErrorCode::EmptyRepoUrl,
            Self::EmptyCommitSha => ErrorCode::EmptyCommitSha,
            Self::NilDetectionResult => ErrorCode::NilDetectionResult,
            Self::EntryPointNotFound { .. } => ErrorCode::EntryPointNotFound,
            Self::InvalidEntryPoint { .. } => ErrorCode::InvalidEntryPoint,
            Self::UnsupportedLanguage { .. } => ErrorCode::UnsupportedLanguage,
        }
    }

    /// The field this failure points at, when it points at one.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::RequiredField { field }
            | Self::InvalidValue { field, .. }
            | Self::NegativeValue { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Build a `ValidationFailed` from a collected error list.
    pub fn validation_failed(errors: Vec<ValidationError>) -> Self {
        let summary = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Self::ValidationFailed { summary, errors }
    }
}

/// Persistence-layer errors.
///
/// Kept apart from [`CoreError`] so the worker can tell a transient store
/// failure (do not ack, let the queue redeliver) from a terminal core
/// failure (fail the job and ack).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {id}")]
    NotFound { id: String },

    #[error("conflicting update for {id}: {reason}")]
    Conflict { id: String, reason: String },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether redelivery may succeed where this attempt failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidTransition { from, to } => {
                CoreError::InvalidStateTransition { from, to }
            }
            StoreError::NotFound { id } => CoreError::InvalidValue {
                field: "id".into(),
                value: format!("{} not found", id),
            },
            other => CoreError::InvalidValue {
                field: "store".into(),
                value: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_form() {
        assert_eq!(ErrorCode::RequiredField.as_str(), "REQUIRED_FIELD");
        assert_eq!(ErrorCode::BuildTimeout.as_str(), "BUILD_TIMEOUT");
        assert_eq!(ErrorCode::NilDetectionResult.as_str(), "NIL_DETECTION_RESULT");
        assert_eq!(
            ErrorCode::InvalidStateTransition.as_str(),
            "INVALID_STATE_TRANSITION"
        );
    }

    #[test]
    fn test_timeout_distinguishable_by_code() {
        let timeout = CoreError::BuildTimeout { seconds: 60 };
        let validation = CoreError::validation_failed(vec![ValidationError::required("id")]);
        let transition = CoreError::InvalidStateTransition {
            from: "succeeded".into(),
            to: "running".into(),
        };

        assert_eq!(timeout.code(), ErrorCode::BuildTimeout);
        assert_eq!(validation.code(), ErrorCode::ValidationFailed);
        assert_eq!(transition.code(), ErrorCode::InvalidStateTransition);
        assert_ne!(timeout.code(), validation.code());
        assert_ne!(validation.code(), transition.code());
    }

    #[test]
    fn test_timeout_message_mentions_timeout() {
        let err = CoreError::BuildTimeout { seconds: 1 };
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_validation_error_constructors() {
        let err = ValidationError::required("build_type");
        assert_eq!(err.field, "build_type");
        assert_eq!(err.code, ErrorCode::RequiredField);

        let err = ValidationError::negative("timeout_seconds", -5);
        assert_eq!(err.code, ErrorCode::NegativeValue);
        assert!(err.message.contains("-5"));
    }

    #[test]
    fn test_core_error_field() {
        let err = CoreError::RequiredField {
            field: "deployment_id".into(),
        };
        assert_eq!(err.field(), Some("deployment_id"));
        assert_eq!(CoreError::EmptyCacheKey.field(), None);
    }

    #[test]
    fn test_error_code_serde_round_trip() {
        let json = serde_json::to_string(&ErrorCode::EntryPointNotFound).unwrap();
        assert_eq!(json, "\"ENTRY_POINT_NOT_FOUND\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::EntryPointNotFound);
    }
}
