//! Build driver boundary and the Nix reference driver.
//!
//! The core never compiles sources itself; it hands a build request to a
//! driver and gets back `{artifact, store_path?, image_tag?, logs}` with
//! exactly one output shape populated, consistent with the build type.
//! Timeout enforcement belongs to the worker (the driver call runs under a
//! cancellable timeout); the request carries the budget for logging only.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::build::{BuildConfig, BuildJob, BuildResult, BuildStrategy, BuildType};
use crate::error::CoreError;

/// Everything a driver needs for one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Snapshot of the job record.
    pub job: BuildJob,
    pub effective_config: BuildConfig,
    pub build_type: BuildType,
    /// Checked-out source tree, present for git sources.
    pub checkout: Option<PathBuf>,
    /// Effective timeout budget; enforced by the caller.
    pub timeout: Duration,
}

/// External build driver seam.
#[async_trait]
pub trait BuildDriver: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<BuildResult>;
}

/// Nix-based reference driver: flake builds for pure artifacts, docker /
/// nixpacks for image strategies, synthesized recipes for auto-*.
pub struct NixDriver;

impl Default for NixDriver {
    fn default() -> Self {
        Self
    }
}

impl NixDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BuildDriver for NixDriver {
    async fn build(&self, request: &BuildRequest) -> Result<BuildResult> {
        let job = &request.job;
        let strategy = job.strategy().unwrap_or(BuildStrategy::Flake);

        match strategy {
            BuildStrategy::Dockerfile => {
                let dir = checkout_dir(request)?;
                build_docker_image(dir, &image_tag_for(job)).await
            }
            BuildStrategy::Nixpacks => {
                let dir = checkout_dir(request)?;
                build_nixpacks_image(dir, &image_tag_for(job)).await
            }
            BuildStrategy::Flake => {
                let flake_ref = flake_reference(job);
                let (store_path, logs) = nix_out_path(&flake_ref).await?;
                finish(request, store_path, logs).await
            }
            _ => {
                // Synthesized recipe: materialize it next to the sources,
                // then build the default package of that flake.
                let dir = checkout_dir(request)?.to_path_buf();
                let recipe = job
                    .generated_recipe
                    .clone()
                    .unwrap_or_else(|| generate_recipe(strategy, &request.effective_config, job));
                tokio::fs::write(dir.join("flake.nix"), &recipe)
                    .await
                    .context("Failed to write synthesized recipe")?;

                let flake_ref = format!("{}#default", dir.display());
                let (store_path, logs) = nix_out_path(&flake_ref).await?;
                finish(request, store_path, logs).await
            }
        }
    }
}

/// For pure builds the store path is the artifact; for oci builds the
/// produced docker-archive is loaded and the tag is the artifact. Driver
/// logs travel on the result either way.
async fn finish(
    request: &BuildRequest,
    store_path: String,
    logs: Vec<String>,
) -> Result<BuildResult> {
    match request.build_type {
        BuildType::PureNix => {
            let mut result = BuildResult::pure(store_path);
            result.logs = logs;
            Ok(result)
        }
        BuildType::Oci => {
            let tag = image_tag_for(&request.job);
            load_docker_archive(&store_path, &tag).await?;
            let mut result = BuildResult::oci(tag);
            result.logs = logs;
            Ok(result)
        }
    }
}

fn checkout_dir(request: &BuildRequest) -> Result<&Path> {
    request
        .checkout
        .as_deref()
        .context("strategy requires a source checkout")
}

/// Flake reference for a direct-recipe job: `<uri>#<output>`.
fn flake_reference(job: &BuildJob) -> String {
    if job.flake_output.is_empty() {
        job.flake_uri.clone()
    } else {
        format!("{}#{}", job.flake_uri, job.flake_output)
    }
}

/// Image tag derived from the job identity and its pinned ref.
fn image_tag_for(job: &BuildJob) -> String {
    let name = job.service_key().replace('/', "-");
    let tag = if job.git_ref.len() >= 7 {
        &job.git_ref[..7]
    } else if !job.git_ref.is_empty() {
        job.git_ref.as_str()
    } else {
        "latest"
    };
    format!("{}:{}", name, tag)
}

/// Driver log lines kept per build; older evaluator chatter is dropped.
const LOG_TAIL: usize = 100;

/// Evaluate and build a flake reference, returning the default out path
/// together with the tail of the evaluator's diagnostics.
///
/// On failure the last meaningful diagnostic line is surfaced in the
/// error; the worker records it on the job. A build that exits cleanly
/// without printing an out path is an artifactless result.
async fn nix_out_path(flake_ref: &str) -> Result<(String, Vec<String>)> {
    debug!(flake_ref = %flake_ref, "invoking nix build");

    let output = Command::new("nix")
        .args(["build", "--no-link", "--print-out-paths", flake_ref])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("could not spawn nix - is nix on PATH?")?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut logs: Vec<String> = stderr.lines().map(|l| l.to_string()).collect();
    if logs.len() > LOG_TAIL {
        logs.drain(..logs.len() - LOG_TAIL);
    }

    if !output.status.success() {
        let diagnostic = logs
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .unwrap_or("no diagnostic output");
        let exit = match output.status.code() {
            Some(code) => code.to_string(),
            None => "signal".to_string(),
        };
        anyhow::bail!("nix build of {} (exit {}): {}", flake_ref, exit, diagnostic);
    }

    // --print-out-paths emits one path per line; a multi-output package
    // lists the default output first.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let Some(store_path) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return Err(anyhow::Error::new(CoreError::NilResult)
            .context(format!("nix build of {} printed no out path", flake_ref)));
    };

    debug!(flake_ref = %flake_ref, store_path = %store_path, "evaluated out path");
    Ok((store_path.to_string(), logs))
}

/// Build an image from a Dockerfile in the checkout.
async fn build_docker_image(dir: &Path, tag: &str) -> Result<BuildResult> {
    info!("Building Docker image {} from {}", tag, dir.display());

    let output = Command::new("docker")
        .args(["build", "-t", tag, "."])
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to execute docker build")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Docker build failed for {}: {}", tag, stderr.trim());
    }

    let mut result = BuildResult::oci(tag);
    result.logs = collect_logs(&output.stdout, &output.stderr);
    Ok(result)
}

/// Build an image with nixpacks.
async fn build_nixpacks_image(dir: &Path, tag: &str) -> Result<BuildResult> {
    info!("Building nixpacks image {} from {}", tag, dir.display());

    let output = Command::new("nixpacks")
        .args(["build", ".", "--name", tag])
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to execute nixpacks build")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("nixpacks build failed for {}: {}", tag, stderr.trim());
    }

    let mut result = BuildResult::oci(tag);
    result.logs = collect_logs(&output.stdout, &output.stderr);
    Ok(result)
}

/// Load a Nix-built docker-archive into the local daemon under a tag.
async fn load_docker_archive(store_path: &str, tag: &str) -> Result<()> {
    let output = Command::new("skopeo")
        .args([
            "copy",
            "--insecure-policy",
            &format!("docker-archive:{}", store_path),
            &format!("docker-daemon:{}", tag),
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to execute skopeo copy")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Image load failed for {}: {}", tag, stderr.trim());
    }
    Ok(())
}

fn collect_logs(stdout: &[u8], stderr: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .chain(String::from_utf8_lossy(stderr).lines())
        .map(|l| l.to_string())
        .collect()
}

/// Synthesize a flake for an auto-* strategy.
///
/// The dependency-lock digest from the job feeds the fetcher of the
/// generated recipe; versions come from the effective config.
pub fn generate_recipe(strategy: BuildStrategy, config: &BuildConfig, job: &BuildJob) -> String {
    let name = job.service_key().replace('/', "-");
    let vendor_hash = if job.vendor_hash.is_empty() {
        "lib.fakeHash".to_string()
    } else {
        format!("\"{}\"", job.vendor_hash)
    };

    match strategy {
        BuildStrategy::AutoGo => {
            let go_attr = version_attr("go", &config.go_version);
            format!(
                r#"{{
  description = "Generated build for {name}";
  inputs.nixpkgs.url = "github:NixOS/nixpkgs/nixos-unstable";
  outputs = {{ self, nixpkgs }}:
    let
      pkgs = nixpkgs.legacyPackages.x86_64-linux;
      inherit (pkgs) lib;
    in {{
      packages.x86_64-linux.default = pkgs.buildGoModule {{
        pname = "{name}";
        version = "0.0.0";
        src = ./.;
        subPackages = [ "{entry}" ];
        vendorHash = {vendor_hash};
        go = pkgs.{go_attr};
      }};
    }};
}}
"#,
                name = name,
                entry = if config.entry_point.is_empty() { "." } else { &config.entry_point },
                vendor_hash = vendor_hash,
                go_attr = go_attr,
            )
        }
        BuildStrategy::AutoRust => format!(
            r#"{{
  description = "Generated build for {name}";
  inputs.nixpkgs.url = "github:NixOS/nixpkgs/nixos-unstable";
  outputs = {{ self, nixpkgs }}:
    let pkgs = nixpkgs.legacyPackages.x86_64-linux;
    in {{
      packages.x86_64-linux.default = pkgs.rustPlatform.buildRustPackage {{
        pname = "{name}";
        version = "0.0.0";
        src = ./.;
        cargoLock.lockFile = ./Cargo.lock;
      }};
    }};
}}
"#,
            name = name,
        ),
        BuildStrategy::AutoNode => format!(
            r#"{{
  description = "Generated build for {name}";
  inputs.nixpkgs.url = "github:NixOS/nixpkgs/nixos-unstable";
  outputs = {{ self, nixpkgs }}:
    let
      pkgs = nixpkgs.legacyPackages.x86_64-linux;
      inherit (pkgs) lib;
    in {{
      packages.x86_64-linux.default = pkgs.buildNpmPackage {{
        pname = "{name}";
        version = "0.0.0";
        src = ./.;
        npmDepsHash = {vendor_hash};
      }};
    }};
}}
"#,
            name = name,
            vendor_hash = vendor_hash,
        ),
        BuildStrategy::AutoPython => format!(
            r#"{{
  description = "Generated build for {name}";
  inputs.nixpkgs.url = "github:NixOS/nixpkgs/nixos-unstable";
  outputs = {{ self, nixpkgs }}:
    let pkgs = nixpkgs.legacyPackages.x86_64-linux;
    in {{
      packages.x86_64-linux.default = pkgs.python3Packages.buildPythonApplication {{
        pname = "{name}";
        version = "0.0.0";
        src = ./.;
        format = "pyproject";
      }};
    }};
}}
"#,
            name = name,
        ),
        BuildStrategy::AutoDatabase => {
            let version = config
                .env
                .get("database_version")
                .map(|s| s.as_str())
                .unwrap_or("16");
            format!(
                r#"{{
  description = "Generated database template for {name}";
  inputs.nixpkgs.url = "github:NixOS/nixpkgs/nixos-unstable";
  outputs = {{ self, nixpkgs }}:
    let pkgs = nixpkgs.legacyPackages.x86_64-linux;
    in {{
      packages.x86_64-linux.default = pkgs.postgresql_{version};
    }};
}}
"#,
                name = name,
                version = version,
            )
        }
        other => {
            debug!(strategy = %other, "no recipe synthesis for strategy");
            String::new()
        }
    }
}

/// Map a language version like "1.22" onto a nixpkgs attribute like
/// `go_1_22`; an empty version picks the default attribute.
fn version_attr(base: &str, version: &str) -> String {
    if version.is_empty() {
        base.to_string()
    } else {
        format!("{}_{}", base, version.replace('.', "_"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::build::SourceType;

    fn job() -> BuildJob {
        let mut job = BuildJob::new("d1", "app1", SourceType::Git);
        job.service_name = Some("api".into());
        job.git_ref = "abc1234def".into();
        job.vendor_hash = "sha256-AAA".into();
        job.build_strategy = "auto-go".into();
        job
    }

    #[test]
    fn test_image_tag_uses_short_ref() {
        assert_eq!(image_tag_for(&job()), "app1-api:abc1234");

        let mut unpinned = job();
        unpinned.git_ref.clear();
        assert_eq!(image_tag_for(&unpinned), "app1-api:latest");
    }

    #[test]
    fn test_flake_reference() {
        let mut job = job();
        job.flake_uri = "github:acme/svc".into();
        assert_eq!(flake_reference(&job), "github:acme/svc");

        job.flake_output = "api".into();
        assert_eq!(flake_reference(&job), "github:acme/svc#api");
    }

    #[test]
    fn test_go_recipe_carries_vendor_hash_and_version() {
        let config = BuildConfig {
            go_version: "1.22".into(),
            entry_point: "cmd/api".into(),
            ..Default::default()
        };
        let recipe = generate_recipe(BuildStrategy::AutoGo, &config, &job());

        assert!(recipe.contains("buildGoModule"));
        assert!(recipe.contains("vendorHash = \"sha256-AAA\""));
        assert!(recipe.contains("go = pkgs.go_1_22"));
        assert!(recipe.contains("subPackages = [ \"cmd/api\" ]"));
    }

    #[test]
    fn test_go_recipe_without_lock_uses_fake_hash() {
        let mut unlocked = job();
        unlocked.vendor_hash.clear();
        let recipe = generate_recipe(BuildStrategy::AutoGo, &BuildConfig::default(), &unlocked);
        assert!(recipe.contains("vendorHash = lib.fakeHash"));
        assert!(recipe.contains("subPackages = [ \".\" ]"));
    }

    #[test]
    fn test_rust_recipe_uses_cargo_lock() {
        let recipe = generate_recipe(BuildStrategy::AutoRust, &BuildConfig::default(), &job());
        assert!(recipe.contains("buildRustPackage"));
        assert!(recipe.contains("cargoLock.lockFile = ./Cargo.lock"));
    }

    #[test]
    fn test_database_recipe_pins_version() {
        let config = BuildConfig {
            env: [("database_version".to_string(), "15".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let recipe = generate_recipe(BuildStrategy::AutoDatabase, &config, &job());
        assert!(recipe.contains("postgresql_15"));

        let recipe = generate_recipe(BuildStrategy::AutoDatabase, &BuildConfig::default(), &job());
        assert!(recipe.contains("postgresql_16"));
    }

    #[test]
    fn test_non_synthesized_strategies_produce_no_recipe() {
        assert!(generate_recipe(BuildStrategy::Flake, &BuildConfig::default(), &job()).is_empty());
        assert!(
            generate_recipe(BuildStrategy::Dockerfile, &BuildConfig::default(), &job()).is_empty()
        );
    }

    #[test]
    fn test_version_attr() {
        assert_eq!(version_attr("go", "1.22"), "go_1_22");
        assert_eq!(version_attr("go", ""), "go");
    }
}
