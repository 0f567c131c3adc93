//! Cache of detection results keyed by `(repo_url, commit_sha)`.
//!
//! Keys are compared by exact byte equality; the cache does not interpret
//! URLs. Stored results come back structurally identical, including
//! entry-point and warning order.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::detection::DetectionResult;
use crate::error::CoreError;

struct Entry {
    result: DetectionResult,
    stored_at: Instant,
}

impl Entry {
    fn is_expired(&self, ttl: Duration) -> bool {
        !ttl.is_zero() && self.stored_at.elapsed() >= ttl
    }
}

/// Shared, TTL-bounded detection cache.
pub struct DetectionCache {
    /// Zero means entries never expire.
    ttl: Duration,
    entries: RwLock<HashMap<(String, String), Entry>>,
}

impl DetectionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a `(repo, commit)` pair. Empty keys, missing entries, and
    /// expired entries all read as "not found".
    pub async fn get(&self, repo_url: &str, commit_sha: &str) -> Option<DetectionResult> {
        if repo_url.is_empty() || commit_sha.is_empty() {
            return None;
        }
        let entries = self.entries.read().await;
        let entry = entries.get(&(repo_url.to_string(), commit_sha.to_string()))?;
        if entry.is_expired(self.ttl) {
            return None;
        }
        Some(entry.result.clone())
    }

    /// Store a result, overwriting any prior entry for the pair.
    pub async fn set(
        &self,
        repo_url: &str,
        commit_sha: &str,
        result: &DetectionResult,
    ) -> Result<(), CoreError> {
        if repo_url.is_empty() {
            return Err(CoreError::EmptyRepoUrl);
        }
        if commit_sha.is_empty() {
            return Err(CoreError::EmptyCommitSha);
        }
        if result.is_empty() {
            return Err(CoreError::NilDetectionResult);
        }

        self.entries.write().await.insert(
            (repo_url.to_string(), commit_sha.to_string()),
            Entry {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
        debug!(repo = %repo_url, commit = %commit_sha, "stored detection result");
        Ok(())
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| !entry.is_expired(ttl));
        before - entries.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn size(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::detection::EntryPoint;

    fn result() -> DetectionResult {
        let mut result = DetectionResult::default();
        result.strategy = "auto-go".into();
        result.framework = "gin".into();
        result.language_version = "1.22".into();
        result.confidence = 0.9;
        result.entry_points = vec![
            EntryPoint::new(".", "root", "Go main package at ."),
            EntryPoint::new("cmd/api", "api", "Go main package at cmd/api"),
        ];
        result.warnings = vec!["no lock file".into()];
        result
    }

    #[tokio::test]
    async fn test_get_returns_exact_stored_result() {
        let cache = DetectionCache::new(Duration::ZERO);
        let stored = result();
        cache.set("https://example/repo", "abc123", &stored).await.unwrap();

        let got = cache.get("https://example/repo", "abc123").await.unwrap();
        assert_eq!(got, stored);
    }

    #[tokio::test]
    async fn test_distinct_keys_are_isolated() {
        let cache = DetectionCache::new(Duration::ZERO);
        let mut a = result();
        a.framework = "gin".into();
        let mut b = result();
        b.framework = "echo".into();

        cache.set("https://example/repo", "abc123", &a).await.unwrap();
        cache.set("https://example/repo", "def456", &b).await.unwrap();
        cache.set("https://example/other", "abc123", &a).await.unwrap();

        assert_eq!(
            cache.get("https://example/repo", "abc123").await.unwrap().framework,
            "gin"
        );
        assert_eq!(
            cache.get("https://example/repo", "def456").await.unwrap().framework,
            "echo"
        );
        assert_eq!(cache.size().await, 3);
    }

    #[tokio::test]
    async fn test_empty_keys_read_as_not_found() {
        let cache = DetectionCache::new(Duration::ZERO);
        cache.set("https://example/repo", "abc123", &result()).await.unwrap();

        assert!(cache.get("", "abc123").await.is_none());
        assert!(cache.get("https://example/repo", "").await.is_none());
    }

    #[tokio::test]
    async fn test_set_rejections() {
        let cache = DetectionCache::new(Duration::ZERO);
        assert_eq!(
            cache.set("", "abc", &result()).await.unwrap_err().code(),
            crate::error::ErrorCode::EmptyRepoUrl
        );
        assert_eq!(
            cache.set("repo", "", &result()).await.unwrap_err().code(),
            crate::error::ErrorCode::EmptyCommitSha
        );
        assert_eq!(
            cache
                .set("repo", "abc", &DetectionResult::default())
                .await
                .unwrap_err()
                .code(),
            crate::error::ErrorCode::NilDetectionResult
        );
    }

    #[tokio::test]
    async fn test_ttl_expiry_without_rewrite() {
        let cache = DetectionCache::new(Duration::from_millis(20));
        cache.set("repo", "abc", &result()).await.unwrap();
        assert!(cache.get("repo", "abc").await.is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("repo", "abc").await.is_none());
        assert_eq!(cache.cleanup_expired().await, 1);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn test_rewrite_refreshes_ttl() {
        let cache = DetectionCache::new(Duration::from_millis(40));
        cache.set("repo", "abc", &result()).await.unwrap();
        std::thread::sleep(Duration::from_millis(25));
        cache.set("repo", "abc", &result()).await.unwrap();
        std::thread::sleep(Duration::from_millis(25));

        // Rewritten within TTL, so still present.
        assert!(cache.get("repo", "abc").await.is_some());
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = DetectionCache::new(Duration::ZERO);
        cache.set("repo", "abc", &result()).await.unwrap();
        cache.clear().await;
        assert_eq!(cache.size().await, 0);
    }
}
