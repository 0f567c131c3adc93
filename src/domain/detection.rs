//! Detection result model.
//!
//! Detection inspects a checked-out source tree and infers the language,
//! framework, build strategy, and buildable entry points. Results are
//! structurally comparable, including entry-point and warning order, so the
//! detection cache can return exactly what was stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Languages the entry-point selector understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Go,
    Node,
    Rust,
    Python,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Node => "node",
            Self::Rust => "rust",
            Self::Python => "python",
        }
    }

    /// Parse a declared language name; anything else is unsupported.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "go" | "golang" => Ok(Self::Go),
            "node" | "nodejs" | "javascript" | "typescript" => Ok(Self::Node),
            "rust" => Ok(Self::Rust),
            "python" => Ok(Self::Python),
            other => Err(CoreError::UnsupportedLanguage {
                language: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A buildable/executable unit in a source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Path relative to the repository root; `.` for the root itself.
    pub path: String,
    /// Short name used by the default-selection heuristic.
    pub name: String,
    /// Stable human description, e.g. "Go main package at cmd/api".
    pub description: String,
    #[serde(default)]
    pub is_default: bool,
}

impl EntryPoint {
    pub fn new(
        path: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            description: description.into(),
            is_default: false,
        }
    }
}

/// Result of a detection pass over a source tree.
///
/// Equality is structural, including entry-point order and warning order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Recommended build strategy, e.g. `auto-go`.
    pub strategy: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub language_version: String,
    /// Detected defaults for the config merger, keyed by BuildConfig field
    /// name. BTreeMap keeps the serialized form deterministic.
    #[serde(default)]
    pub suggested_config: BTreeMap<String, String>,
    #[serde(default)]
    pub recommended_build_type: String,
    #[serde(default)]
    pub entry_points: Vec<EntryPoint>,
    /// Confidence in [0, 1].
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl DetectionResult {
    /// A result that carries no content is the "nil" rendition of the
    /// original contract; the detection cache refuses to store one.
    pub fn is_empty(&self) -> bool {
        self.strategy.is_empty() && self.framework.is_empty() && self.entry_points.is_empty()
    }

    /// The entry point flagged as default, when enumeration produced any.
    pub fn default_entry_point(&self) -> Option<&EntryPoint> {
        self.entry_points.iter().find(|e| e.is_default)
    }
}

impl Default for DetectionResult {
    fn default() -> Self {
        Self {
            strategy: String::new(),
            framework: String::new(),
            language_version: String::new(),
            suggested_config: BTreeMap::new(),
            recommended_build_type: String::new(),
            entry_points: Vec::new(),
            confidence: 0.0,
            warnings: Vec::new(),
        }
    }
}
