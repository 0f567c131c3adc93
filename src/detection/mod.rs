//! Source-tree detection: language, framework, version, strategy.
//!
//! Detection is a snapshot of a checked-out tree. It never mutates the
//! tree and enumerates entry points as a finite ordered sequence.

pub mod entrypoints;

use std::fs;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::domain::build::{BuildStrategy, BuildType};
use crate::domain::detection::{DetectionResult, Language};
use crate::error::CoreError;

/// Inspect a checked-out source tree and infer language, framework,
/// version, strategy, and entry points.
///
/// Marker priority when several ecosystems are present: Go, Rust, Node,
/// Python, then a bare Dockerfile; lower-priority markers are surfaced as
/// warnings instead.
pub fn detect(repo: &Path) -> Result<DetectionResult, CoreError> {
    let markers = scan_markers(repo);
    debug!(path = %repo.display(), ?markers, "scanned ecosystem markers");

    let language = if markers.go {
        Some(Language::Go)
    } else if markers.rust {
        Some(Language::Rust)
    } else if markers.node {
        Some(Language::Node)
    } else if markers.python {
        Some(Language::Python)
    } else {
        None
    };

    let mut result = DetectionResult::default();

    let Some(language) = language else {
        if markers.dockerfile {
            result.strategy = BuildStrategy::Dockerfile.as_str().into();
            result.recommended_build_type = BuildType::Oci.as_str().into();
            result.confidence = 0.5;
            result
                .warnings
                .push("no supported ecosystem manifest; falling back to Dockerfile".into());
            return Ok(result);
        }
        return Err(CoreError::UnsupportedLanguage {
            language: "unknown".into(),
        });
    };

    result.strategy = strategy_for(language).as_str().into();
    result.recommended_build_type = BuildType::PureNix.as_str().into();
    result.entry_points = entrypoints::enumerate(repo, language)?;

    match language {
        Language::Go => detect_go(repo, &mut result),
        Language::Rust => detect_rust(repo, &mut result),
        Language::Node => detect_node(repo, &mut result),
        Language::Python => detect_python(repo, &mut result),
    }

    if let Some(entry) = result.default_entry_point() {
        result
            .suggested_config
            .insert("entry_point".into(), entry.path.clone());
    }

    if markers.count() > 1 {
        result
            .warnings
            .push("multiple ecosystem manifests present; picked by priority".into());
    }
    if markers.dockerfile {
        result
            .warnings
            .push("Dockerfile present; dockerfile strategy available as override".into());
    }

    result.confidence = confidence(&result);
    Ok(result)
}

fn strategy_for(language: Language) -> BuildStrategy {
    match language {
        Language::Go => BuildStrategy::AutoGo,
        Language::Rust => BuildStrategy::AutoRust,
        Language::Node => BuildStrategy::AutoNode,
        Language::Python => BuildStrategy::AutoPython,
    }
}

#[derive(Debug, Default)]
struct Markers {
    go: bool,
    rust: bool,
    node: bool,
    python: bool,
    dockerfile: bool,
}

impl Markers {
    fn count(&self) -> usize {
        [self.go, self.rust, self.node, self.python]
            .iter()
            .filter(|m| **m)
            .count()
    }
}

fn scan_markers(repo: &Path) -> Markers {
    Markers {
        go: repo.join("go.mod").is_file(),
        rust: repo.join("Cargo.toml").is_file(),
        node: repo.join("package.json").is_file(),
        python: repo.join("pyproject.toml").is_file()
            || repo.join("requirements.txt").is_file()
            || repo.join("setup.py").is_file(),
        dockerfile: repo.join("Dockerfile").is_file(),
    }
}

fn confidence(result: &DetectionResult) -> f64 {
    let mut confidence: f64 = 0.9;
    if result.entry_points.is_empty() {
        confidence -= 0.3;
    }
    if result
        .warnings
        .iter()
        .any(|w| w.contains("lock file"))
    {
        confidence -= 0.2;
    }
    confidence.clamp(0.0, 1.0)
}

fn detect_go(repo: &Path, result: &mut DetectionResult) {
    if let Ok(gomod) = fs::read_to_string(repo.join("go.mod")) {
        for line in gomod.lines() {
            let line = line.trim();
            if let Some(version) = line.strip_prefix("go ") {
                result.language_version = version.trim().to_string();
                result
                    .suggested_config
                    .insert("go_version".into(), result.language_version.clone());
            }
        }
        result.framework = match_first(
            &gomod,
            &[
                ("github.com/gin-gonic/gin", "gin"),
                ("github.com/labstack/echo", "echo"),
                ("github.com/gofiber/fiber", "fiber"),
                ("github.com/go-chi/chi", "chi"),
            ],
        );
    }
    if !repo.join("go.sum").is_file() {
        result.warnings.push("no go.sum lock file".into());
    }
    if uses_cgo(repo) {
        result.suggested_config.insert("enable_cgo".into(), "true".into());
    }
}

/// Whether any Go source in the tree imports "C". Bounded to the first few
/// hundred files; detection is a heuristic, not an audit.
fn uses_cgo(repo: &Path) -> bool {
    WalkDir::new(repo)
        .into_iter()
        .filter_entry(|e| e.file_name().to_str() != Some("vendor"))
        .flatten()
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("go"))
        .take(500)
        .any(|e| {
            fs::read_to_string(e.path())
                .map(|src| src.contains("import \"C\""))
                .unwrap_or(false)
        })
}

fn detect_rust(repo: &Path, result: &mut DetectionResult) {
    if let Ok(manifest) = fs::read_to_string(repo.join("Cargo.toml")) {
        if let Ok(parsed) = toml::from_str::<toml::Value>(&manifest) {
            if let Some(version) = parsed
                .get("package")
                .and_then(|p| p.get("rust-version"))
                .and_then(|v| v.as_str())
            {
                result.language_version = version.to_string();
                result
                    .suggested_config
                    .insert("rust_version".into(), version.to_string());
            }
        }
        result.framework = match_first(
            &manifest,
            &[
                ("axum", "axum"),
                ("actix-web", "actix"),
                ("rocket", "rocket"),
                ("warp", "warp"),
            ],
        );
    }
    if !repo.join("Cargo.lock").is_file() {
        result.warnings.push("no Cargo.lock lock file".into());
    }
}

fn detect_node(repo: &Path, result: &mut DetectionResult) {
    if let Ok(manifest) = fs::read_to_string(repo.join("package.json")) {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&manifest) {
            if let Some(node) = parsed
                .get("engines")
                .and_then(|e| e.get("node"))
                .and_then(|n| n.as_str())
            {
                result.language_version = node.trim_start_matches(['>', '=', '^', '~']).to_string();
                result
                    .suggested_config
                    .insert("node_version".into(), result.language_version.clone());
            }
            let deps = parsed.get("dependencies").cloned().unwrap_or_default();
            let deps_text = deps.to_string();
            result.framework = match_first(
                &deps_text,
                &[
                    ("next", "next"),
                    ("express", "express"),
                    ("fastify", "fastify"),
                    ("koa", "koa"),
                ],
            );
            if let Some(scripts) = parsed.get("scripts") {
                if let Some(build) = scripts.get("build").and_then(|s| s.as_str()) {
                    result
                        .suggested_config
                        .insert("build_command".into(), build.to_string());
                }
                if let Some(start) = scripts.get("start").and_then(|s| s.as_str()) {
                    result
                        .suggested_config
                        .insert("start_command".into(), start.to_string());
                }
            }
        }
    }
    let has_lock = ["package-lock.json", "yarn.lock", "pnpm-lock.yaml"]
        .iter()
        .any(|name| repo.join(name).is_file());
    if !has_lock {
        result.warnings.push("no package lock file".into());
    }
}

fn detect_python(repo: &Path, result: &mut DetectionResult) {
    if let Ok(manifest) = fs::read_to_string(repo.join("pyproject.toml")) {
        if let Ok(parsed) = toml::from_str::<toml::Value>(&manifest) {
            if let Some(requires) = parsed
                .get("project")
                .and_then(|p| p.get("requires-python"))
                .and_then(|v| v.as_str())
            {
                result.language_version =
                    requires.trim_start_matches(['>', '=', '^', '~', '<']).to_string();
                result
                    .suggested_config
                    .insert("python_version".into(), result.language_version.clone());
            }
        }
        result.framework = match_first(
            &manifest,
            &[
                ("django", "django"),
                ("fastapi", "fastapi"),
                ("flask", "flask"),
            ],
        );
    } else if let Ok(requirements) = fs::read_to_string(repo.join("requirements.txt")) {
        result.framework = match_first(
            &requirements,
            &[
                ("django", "django"),
                ("fastapi", "fastapi"),
                ("flask", "flask"),
            ],
        );
    }
    let has_lock = ["poetry.lock", "requirements.txt", "uv.lock"]
        .iter()
        .any(|name| repo.join(name).is_file());
    if !has_lock {
        result.warnings.push("no dependency lock file".into());
    }
}

fn match_first(haystack: &str, needles: &[(&str, &str)]) -> String {
    needles
        .iter()
        .find(|(needle, _)| haystack.contains(needle))
        .map(|(_, name)| name.to_string())
        .unwrap_or_default()
}
