//! Entry-point enumeration and validation.
//!
//! Given a checked-out source tree and a language, enumerate the buildable
//! entry points as a finite ordered snapshot of the filesystem, then flag
//! exactly one as the default. Presence is determined by inspecting
//! sources and manifests, not by file-name convention alone (a Go
//! directory is an entry point because a file in it declares `package
//! main`, not because it lives under `cmd/`).

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::domain::detection::{EntryPoint, Language};
use crate::error::CoreError;

/// Directories whose immediate children are scanned for Go main packages.
const GO_COMMAND_ROOTS: [&str; 3] = ["cmd", "apps", "services"];

/// Conventional Node entry files, tried at the root and under `src/`.
const NODE_CONVENTIONAL: [&str; 4] = ["index.js", "server.js", "app.js", "main.js"];

/// Conventional Python entry files at the repository root.
const PYTHON_CONVENTIONAL: [&str; 5] = ["main.py", "app.py", "server.py", "run.py", "manage.py"];

/// File extensions accepted as executable scripts by [`validate`].
const SCRIPT_EXTENSIONS: [&str; 7] = ["py", "js", "mjs", "cjs", "ts", "sh", "rs"];

/// Names the default-selection heuristic prefers, in order of the rule,
/// compared case-insensitively.
const PREFERRED_NAMES: [&str; 4] = ["main", "app", "server", "api"];

/// Enumerate entry points for a language and flag exactly one default.
pub fn enumerate(repo: &Path, language: Language) -> Result<Vec<EntryPoint>, CoreError> {
    let mut entries = match language {
        Language::Go => enumerate_go(repo),
        Language::Node => enumerate_node(repo),
        Language::Rust => enumerate_rust(repo),
        Language::Python => enumerate_python(repo),
    };
    select_default(&mut entries);
    debug!(language = %language, count = entries.len(), "enumerated entry points");
    Ok(entries)
}

/// Apply the default-selection heuristic, leaving exactly one entry
/// flagged when the list is non-empty:
/// an already-flagged entry wins; else the first entry named `main`,
/// `app`, `server`, or `api` (case-insensitive); else an entry at `.`;
/// else the first entry.
pub fn select_default(entries: &mut [EntryPoint]) {
    if entries.is_empty() {
        return;
    }

    let flagged: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_default)
        .map(|(i, _)| i)
        .collect();

    let chosen = if let Some(first) = flagged.first() {
        *first
    } else {
        PREFERRED_NAMES
            .iter()
            .find_map(|name| {
                entries
                    .iter()
                    .position(|e| e.name.eq_ignore_ascii_case(name))
            })
            .or_else(|| entries.iter().position(|e| e.path == "."))
            .unwrap_or(0)
    };

    for (i, entry) in entries.iter_mut().enumerate() {
        entry.is_default = i == chosen;
    }
}

/// Check that an entry point exists in the tree and is buildable: either a
/// directory or a file with a known executable-script extension.
pub fn validate(repo: &Path, entry_point: &str) -> Result<(), CoreError> {
    if entry_point.is_empty() {
        return Err(CoreError::EntryPointNotFound {
            path: entry_point.to_string(),
        });
    }

    let full = if entry_point == "." {
        repo.to_path_buf()
    } else {
        repo.join(entry_point)
    };

    if !full.exists() {
        return Err(CoreError::EntryPointNotFound {
            path: entry_point.to_string(),
        });
    }
    if full.is_dir() {
        return Ok(());
    }

    let extension = full
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if SCRIPT_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(CoreError::InvalidEntryPoint {
            path: entry_point.to_string(),
            reason: format!("not a directory or executable script (.{})", extension),
        })
    }
}

// --- Go ---

fn enumerate_go(repo: &Path) -> Vec<EntryPoint> {
    let mut entries = Vec::new();

    if dir_has_main_package(repo) {
        entries.push(EntryPoint::new(".", "root", "Go main package at ."));
    }

    for root in GO_COMMAND_ROOTS {
        let base = repo.join(root);
        for child in sorted_subdirs(&base) {
            let dir = base.join(&child);
            if dir_has_main_package(&dir) {
                let path = format!("{}/{}", root, child);
                entries.push(EntryPoint::new(
                    path.clone(),
                    child,
                    format!("Go main package at {}", path),
                ));
            }
        }
    }

    entries
}

/// A directory contains a Go main package iff some `.go` file in it (not
/// recursing) declares `package main`.
fn dir_has_main_package(dir: &Path) -> bool {
    let Ok(read) = fs::read_dir(dir) else {
        return false;
    };
    let mut files: Vec<_> = read
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("go"))
        .collect();
    files.sort();

    files.iter().any(|path| {
        fs::read_to_string(path)
            .map(|src| go_package_name(&src).as_deref() == Some("main"))
            .unwrap_or(false)
    })
}

/// Extract the package name from a Go source file: the first `package`
/// clause outside comments.
fn go_package_name(source: &str) -> Option<String> {
    let mut in_block_comment = false;
    for line in source.lines() {
        let mut rest = line.trim();
        if in_block_comment {
            match rest.find("*/") {
                Some(end) => {
                    in_block_comment = false;
                    rest = rest[end + 2..].trim_start();
                }
                None => continue,
            }
        }
        if rest.starts_with("//") || rest.is_empty() {
            continue;
        }
        if let Some(start) = rest.find("/*") {
            // Comment opening before any code on this line.
            if start == 0 {
                in_block_comment = !rest[start + 2..].contains("*/");
                continue;
            }
        }
        if let Some(name) = rest.strip_prefix("package ") {
            let name = name.split_whitespace().next().unwrap_or("");
            return Some(name.to_string());
        }
        // First real line was not a package clause; not a valid Go file.
        return None;
    }
    None
}

// --- Node ---

fn enumerate_node(repo: &Path) -> Vec<EntryPoint> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    if let Some(manifest) = read_json(&repo.join("package.json")) {
        if let Some(main) = manifest.get("main").and_then(|v| v.as_str()) {
            if !main.is_empty() && seen.insert(main.to_string()) {
                entries.push(EntryPoint::new(
                    main,
                    file_stem(main),
                    format!("Node main entry from package manifest: {}", main),
                ));
            }
        }
        match manifest.get("bin") {
            Some(serde_json::Value::String(path)) => {
                if seen.insert(path.clone()) {
                    let name = manifest
                        .get("name")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| file_stem(path));
                    entries.push(EntryPoint::new(
                        path.clone(),
                        name.clone(),
                        format!("Node bin entry {}: {}", name, path),
                    ));
                }
            }
            Some(serde_json::Value::Object(bins)) => {
                for (name, path) in bins {
                    if let Some(path) = path.as_str() {
                        if seen.insert(path.to_string()) {
                            entries.push(EntryPoint::new(
                                path,
                                name.clone(),
                                format!("Node bin entry {}: {}", name, path),
                            ));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if entries.is_empty() {
        for name in NODE_CONVENTIONAL {
            if repo.join(name).is_file() && seen.insert(name.to_string()) {
                entries.push(EntryPoint::new(
                    name,
                    file_stem(name),
                    format!("Node conventional entry: {}", name),
                ));
            }
        }
        for name in NODE_CONVENTIONAL {
            let path = format!("src/{}", name);
            if repo.join(&path).is_file() && seen.insert(path.clone()) {
                entries.push(EntryPoint::new(
                    path.clone(),
                    file_stem(name),
                    format!("Node conventional entry: {}", path),
                ));
            }
        }
    }

    entries
}

// --- Rust ---

fn enumerate_rust(repo: &Path) -> Vec<EntryPoint> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    let manifest: Option<toml::Value> = fs::read_to_string(repo.join("Cargo.toml"))
        .ok()
        .and_then(|s| toml::from_str(&s).ok());

    let package_name = manifest
        .as_ref()
        .and_then(|m| m.get("package"))
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
        .unwrap_or("main")
        .to_string();

    // Explicit [[bin]] tables first; they define path and name.
    if let Some(bins) = manifest
        .as_ref()
        .and_then(|m| m.get("bin"))
        .and_then(|b| b.as_array())
    {
        for bin in bins {
            let name = bin.get("name").and_then(|n| n.as_str()).unwrap_or(&package_name);
            let path = bin
                .get("path")
                .and_then(|p| p.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("src/bin/{}.rs", name));
            if seen.insert(path.clone()) {
                entries.push(EntryPoint::new(
                    path.clone(),
                    name,
                    format!("Rust binary {}: {}", name, path),
                ));
            }
        }
    }

    // Default binary from src/main.rs, named after the package.
    if repo.join("src/main.rs").is_file() && seen.insert("src/main.rs".to_string()) {
        let mut entry = EntryPoint::new(
            "src/main.rs",
            package_name.clone(),
            format!("Rust default binary {}: src/main.rs", package_name),
        );
        entry.is_default = true;
        entries.insert(0, entry);
    }

    // Additional binaries under src/bin/.
    for child in sorted_files_with_extension(&repo.join("src/bin"), "rs") {
        let path = format!("src/bin/{}", child);
        if seen.insert(path.clone()) {
            let name = file_stem(&child);
            entries.push(EntryPoint::new(
                path.clone(),
                name.clone(),
                format!("Rust binary {}: {}", name, path),
            ));
        }
    }

    entries
}

// --- Python ---

fn enumerate_python(repo: &Path) -> Vec<EntryPoint> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for name in PYTHON_CONVENTIONAL {
        if repo.join(name).is_file() && seen.insert(name.to_string()) {
            entries.push(EntryPoint::new(
                name,
                file_stem(name),
                format!("Python script: {}", name),
            ));
        }
    }

    let manifest: Option<toml::Value> = fs::read_to_string(repo.join("pyproject.toml"))
        .ok()
        .and_then(|s| toml::from_str(&s).ok());
    if let Some(scripts) = manifest
        .as_ref()
        .and_then(|m| m.get("project"))
        .and_then(|p| p.get("scripts"))
        .and_then(|s| s.as_table())
    {
        for (name, target) in scripts {
            let target = target.as_str().unwrap_or("");
            // Script targets are `module:function`; the module maps onto
            // a file path for validation purposes.
            let path = format!("{}.py", target.split(':').next().unwrap_or(name).replace('.', "/"));
            if seen.insert(path.clone()) {
                entries.push(EntryPoint::new(
                    path.clone(),
                    name.clone(),
                    format!("Python project script {}: {}", name, target),
                ));
            }
        }
    }

    entries
}

// --- helpers ---

fn read_json(path: &Path) -> Option<serde_json::Value> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

fn sorted_subdirs(base: &Path) -> Vec<String> {
    let Ok(read) = fs::read_dir(base) else {
        return Vec::new();
    };
    let mut dirs: Vec<String> = read
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .collect();
    dirs.sort();
    dirs
}

fn sorted_files_with_extension(base: &Path, extension: &str) -> Vec<String> {
    let Ok(read) = fs::read_dir(base) else {
        return Vec::new();
    };
    let mut files: Vec<String> = read
        .flatten()
        .filter(|e| e.path().is_file())
        .filter(|e| {
            e.path().extension().and_then(|x| x.to_str()) == Some(extension)
        })
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .collect();
    files.sort();
    files
}

fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_go_root_and_cmd_entries() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "main.go", "package main\n\nfunc main() {}\n");
        write(root, "cmd/api/main.go", "package main\n\nfunc main() {}\n");
        write(root, "cmd/worker/run.go", "package main\n\nfunc main() {}\n");
        write(root, "cmd/shared/util.go", "package shared\n");
        write(root, "services/billing/main.go", "package main\n");

        let entries = enumerate(root, Language::Go).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec![".", "cmd/api", "cmd/worker", "services/billing"]);
        assert!(!paths.contains(&"cmd/shared"));
    }

    #[test]
    fn test_go_package_detection_is_source_based() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        // File named main.go but not a main package: no entry point.
        write(root, "cmd/lib/main.go", "package lib\n");
        // File with an unassuming name but a main package: entry point.
        write(
            root,
            "cmd/tool/xyz.go",
            "// a tool\n/* block\ncomment */\npackage main\n",
        );

        let entries = enumerate(root, Language::Go).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["cmd/tool"]);
    }

    #[test]
    fn test_go_package_name_parsing() {
        assert_eq!(go_package_name("package main\n").as_deref(), Some("main"));
        assert_eq!(
            go_package_name("// comment\npackage api // trailing\n").as_deref(),
            Some("api")
        );
        assert_eq!(
            go_package_name("/* multi\nline */\npackage main\n").as_deref(),
            Some("main")
        );
        assert_eq!(go_package_name("import \"fmt\"\n"), None);
    }

    #[test]
    fn test_node_manifest_entries_preferred() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(
            root,
            "package.json",
            r#"{"name":"svc","main":"lib/index.js","bin":{"svc-cli":"bin/cli.js"}}"#,
        );
        write(root, "index.js", "// fallback, ignored");

        let entries = enumerate(root, Language::Node).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["lib/index.js", "bin/cli.js"]);
    }

    #[test]
    fn test_node_conventional_fallback_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "package.json", r#"{"name":"svc"}"#);
        write(root, "server.js", "");
        write(root, "src/index.js", "");

        let entries = enumerate(root, Language::Node).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["server.js", "src/index.js"]);
    }

    #[test]
    fn test_rust_default_and_extra_binaries() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "Cargo.toml", "[package]\nname = \"svc\"\n");
        write(root, "src/main.rs", "fn main() {}");
        write(root, "src/bin/migrate.rs", "fn main() {}");
        write(root, "src/bin/admin.rs", "fn main() {}");

        let entries = enumerate(root, Language::Rust).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["src/main.rs", "src/bin/admin.rs", "src/bin/migrate.rs"]);
        assert_eq!(entries[0].name, "svc");
        assert!(entries[0].is_default);
    }

    #[test]
    fn test_python_conventional_and_scripts_deduped() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "main.py", "");
        write(root, "manage.py", "");
        write(
            root,
            "pyproject.toml",
            "[project]\nname = \"svc\"\n[project.scripts]\nsvc = \"main:run\"\n",
        );

        let entries = enumerate(root, Language::Python).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        // main.py appears once: the script target duplicates it by path.
        assert_eq!(paths, vec!["main.py", "manage.py"]);
    }

    #[test]
    fn test_default_selection_heuristic() {
        // Preferred name wins over position.
        let mut entries = vec![
            EntryPoint::new("cmd/worker", "worker", ""),
            EntryPoint::new("cmd/api", "api", ""),
        ];
        select_default(&mut entries);
        assert!(!entries[0].is_default);
        assert!(entries[1].is_default);

        // Path "." wins when no preferred name matches.
        let mut entries = vec![
            EntryPoint::new("cmd/worker", "worker", ""),
            EntryPoint::new(".", "root", ""),
        ];
        select_default(&mut entries);
        assert!(entries[1].is_default);

        // First entry as last resort.
        let mut entries = vec![
            EntryPoint::new("cmd/one", "one", ""),
            EntryPoint::new("cmd/two", "two", ""),
        ];
        select_default(&mut entries);
        assert!(entries[0].is_default);

        // An already-flagged entry is kept; extra flags are cleared.
        let mut entries = vec![
            EntryPoint::new("cmd/main", "main", ""),
            EntryPoint {
                is_default: true,
                ..EntryPoint::new("cmd/chosen", "chosen", "")
            },
        ];
        select_default(&mut entries);
        let defaults: Vec<&str> = entries
            .iter()
            .filter(|e| e.is_default)
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(defaults, vec!["cmd/chosen"]);
    }

    #[test]
    fn test_exactly_one_default_always() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "main.go", "package main\n");
        write(root, "cmd/api/main.go", "package main\n");

        let entries = enumerate(root, Language::Go).unwrap();
        assert_eq!(entries.iter().filter(|e| e.is_default).count(), 1);
    }

    #[test]
    fn test_validate_entry_points() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "cmd/api/main.go", "package main\n");
        write(root, "run.py", "");
        write(root, "binary.bin", "");

        assert!(validate(root, ".").is_ok());
        assert!(validate(root, "cmd/api").is_ok());
        assert!(validate(root, "run.py").is_ok());

        let err = validate(root, "does/not/exist").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::EntryPointNotFound);

        let err = validate(root, "binary.bin").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidEntryPoint);

        let err = validate(root, "").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::EntryPointNotFound);
    }
}
