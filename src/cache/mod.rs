//! Content-addressed caches for detection results and build outputs.

pub mod build_cache;
pub mod detection_cache;

pub use build_cache::{BuildCache, CacheStats, CachedBuild};
pub use detection_cache::DetectionCache;
