//! Binary cache operations.
//!
//! Handles pushing build closures to an Attic binary cache. A push covers
//! the transitive closure of the store path, not only the top path; the
//! attic CLI guarantees that for us.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::CoreError;

/// Receipt for a completed closure push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    /// URL of the cache the closure landed in.
    pub cache_url: String,
    pub store_path: String,
}

/// Seam for pushing reproducible-build closures to an artifact store.
#[async_trait]
pub trait ArtifactPusher: Send + Sync {
    /// Upload the transitive closure of `store_path`.
    async fn push_closure(&self, store_path: &str) -> Result<PushReceipt>;
}

/// Client for Attic cache operations.
pub struct BinaryCacheClient {
    cache_name: String,
    server_url: String,
    token: Option<String>,
}

impl BinaryCacheClient {
    /// Create a new cache client.
    pub fn new(cache_name: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            server_url: server_url.into(),
            token: None,
        }
    }

    /// Set authentication token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Discover the cache token from the environment.
    pub fn discover_token() -> Option<String> {
        std::env::var("ATTIC_TOKEN").ok().filter(|s| !s.is_empty())
    }

    /// Create a client with an auto-discovered token.
    pub fn discover(cache_name: impl Into<String>, server_url: impl Into<String>) -> Self {
        let mut client = Self::new(cache_name, server_url);
        if let Some(token) = Self::discover_token() {
            client.token = Some(token);
        }
        client
    }

    /// URL entries of this cache land under.
    pub fn cache_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.cache_name)
    }

    /// Check if the attic CLI is available.
    pub async fn is_available() -> bool {
        Command::new("attic")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ArtifactPusher for BinaryCacheClient {
    async fn push_closure(&self, store_path: &str) -> Result<PushReceipt> {
        if store_path.is_empty() {
            return Err(CoreError::EmptyArtifact.into());
        }

        info!(cache = %self.cache_name, path = %store_path, "pushing closure to binary cache");

        let mut cmd = Command::new("attic");
        cmd.args(["push", &self.cache_name, store_path]);

        if let Some(ref token) = self.token {
            cmd.env("ATTIC_TOKEN", token);
        }

        let output = cmd.output().await.context("Failed to execute attic push")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Closure push failed for {}: {}",
                store_path,
                stderr.trim()
            );
        }

        info!(cache = %self.cache_name, "closure pushed");
        Ok(PushReceipt {
            cache_url: self.cache_url(),
            store_path: store_path.to_string(),
        })
    }
}
