//! Content-addressed cache of past build outputs.
//!
//! Keyed by a sha256 fingerprint over `{source_hash, deps_hash,
//! config_hash, strategy, build_type}` in canonical JSON form, so identical
//! jobs produce identical keys on any process instance.
//!
//! The cache also owns the fingerprint locks that give the system its
//! at-most-one-build-per-fingerprint property: a worker holds the lock for
//! a key across its check / build / store sequence, so a concurrent worker
//! with the same fingerprint waits and then observes the stored artifact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::domain::build::{BuildJob, BuildResult, BuildType};
use crate::error::CoreError;

/// Hex-encoded sha256 of a string.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// The five-field fingerprint hashed into the cache key. Field order is
/// fixed, which is what makes the JSON form canonical.
#[derive(Serialize)]
struct Fingerprint<'a> {
    source_hash: &'a str,
    deps_hash: &'a str,
    config_hash: &'a str,
    strategy: &'a str,
    build_type: &'a str,
}

/// A stored build output together with the sub-hashes it was keyed from.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBuild {
    pub artifact: String,
    pub build_type: BuildType,
    pub created_at: DateTime<Utc>,
    pub source_hash: String,
    pub deps_hash: String,
    pub config_hash: String,
    pub result: BuildResult,
}

struct Entry {
    cached: CachedBuild,
    stored_at: Instant,
    service_key: String,
}

impl Entry {
    fn is_expired(&self, ttl: Duration) -> bool {
        !ttl.is_zero() && self.stored_at.elapsed() >= ttl
    }
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub total: usize,
    pub by_service: HashMap<String, usize>,
    pub expired: usize,
}

/// Shared, TTL-bounded build cache.
pub struct BuildCache {
    /// Zero means entries never expire.
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BuildCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Compute the fingerprint key for a job.
    ///
    /// `source_hash` is the pinned ref when present, otherwise a hash of
    /// the repository URL; `deps_hash` is the dependency-lock digest;
    /// `config_hash` covers the canonical build config.
    pub fn cache_key(job: &BuildJob) -> Result<String, CoreError> {
        if job.id.is_empty() {
            return Err(CoreError::NilBuildJob);
        }

        let source_hash = if !job.git_ref.is_empty() {
            job.git_ref.clone()
        } else {
            sha256_hex(&job.git_url)
        };
        let config_json = job
            .build_config
            .as_ref()
            .map(|c| c.canonical_json())
            .unwrap_or_else(|| "{}".to_string());
        let config_hash = sha256_hex(&config_json);

        let fingerprint = Fingerprint {
            source_hash: &source_hash,
            deps_hash: &job.vendor_hash,
            config_hash: &config_hash,
            strategy: &job.build_strategy,
            build_type: &job.build_type,
        };
        let canonical = serde_json::to_string(&fingerprint).map_err(|e| {
            CoreError::InvalidValue {
                field: "fingerprint".into(),
                value: e.to_string(),
            }
        })?;
        Ok(sha256_hex(&canonical))
    }

    /// Look up a key. Expired entries are reported as such but left in
    /// place for `cleanup_expired` to collect.
    pub async fn check(&self, key: &str) -> Result<CachedBuild, CoreError> {
        if key.is_empty() {
            return Err(CoreError::EmptyCacheKey);
        }
        let entries = self.entries.read().await;
        match entries.get(key) {
            None => Err(CoreError::CacheNotFound { key: key.to_string() }),
            Some(entry) if entry.is_expired(self.ttl) => {
                Err(CoreError::CacheExpired { key: key.to_string() })
            }
            Some(entry) => Ok(entry.cached.clone()),
        }
    }

    /// Store a build result under a key, overwriting any prior entry.
    ///
    /// The entry's build type is derived from the result shape (store path
    /// means pure, image tag means oci). The optional job supplies the
    /// service grouping and sub-hashes.
    pub async fn store(
        &self,
        key: &str,
        result: &BuildResult,
        job: Option<&BuildJob>,
    ) -> Result<(), CoreError> {
        if key.is_empty() {
            return Err(CoreError::EmptyCacheKey);
        }
        if result.is_empty() {
            return Err(CoreError::NilResult);
        }
        if result.artifact.is_empty() {
            return Err(CoreError::EmptyArtifact);
        }
        let build_type = result.derived_build_type().ok_or(CoreError::NilResult)?;

        let (service_key, source_hash, deps_hash, config_hash) = match job {
            Some(job) => {
                let source_hash = if !job.git_ref.is_empty() {
                    job.git_ref.clone()
                } else {
                    sha256_hex(&job.git_url)
                };
                let config_json = job
                    .build_config
                    .as_ref()
                    .map(|c| c.canonical_json())
                    .unwrap_or_else(|| "{}".to_string());
                (
                    job.service_key(),
                    source_hash,
                    job.vendor_hash.clone(),
                    sha256_hex(&config_json),
                )
            }
            None => (String::new(), String::new(), String::new(), String::new()),
        };

        let entry = Entry {
            cached: CachedBuild {
                artifact: result.artifact.clone(),
                build_type,
                created_at: Utc::now(),
                source_hash,
                deps_hash,
                config_hash,
                result: result.clone(),
            },
            stored_at: Instant::now(),
            service_key,
        };

        self.entries.write().await.insert(key.to_string(), entry);
        debug!(key = %key, build_type = %build_type, "stored build cache entry");
        Ok(())
    }

    /// Remove a single key.
    pub async fn invalidate(&self, key: &str) -> Result<(), CoreError> {
        if key.is_empty() {
            return Err(CoreError::EmptyCacheKey);
        }
        self.entries.write().await.remove(key);
        Ok(())
    }

    /// Remove every entry stored under a service key. Idempotent when the
    /// service has no entries; returns how many were removed.
    pub async fn invalidate_service(&self, service_key: &str) -> Result<usize, CoreError> {
        if service_key.is_empty() {
            return Err(CoreError::EmptyServiceId);
        }
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.service_key != service_key);
        Ok(before - entries.len())
    }

    /// Drop expired entries and stale fingerprint locks; returns the
    /// number of cache entries removed.
    pub async fn cleanup_expired(&self) -> usize {
        let removed = {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            let ttl = self.ttl;
            entries.retain(|_, entry| !entry.is_expired(ttl));
            before - entries.len()
        };

        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        removed
    }

    pub async fn list_keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let mut stats = CacheStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            if !entry.service_key.is_empty() {
                *stats.by_service.entry(entry.service_key.clone()).or_insert(0) += 1;
            }
            if entry.is_expired(self.ttl) {
                stats.expired += 1;
            }
        }
        stats
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn size(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Acquire the fingerprint lock for a key. The guard is owned so it
    /// can be held across await points; holding it serializes the
    /// check / build / store sequence for that fingerprint.
    pub async fn lock_fingerprint(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
