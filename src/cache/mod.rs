//! # Cache Module
//!
//! Keeps parsed sidecar metadata (`<id>.info.json`) in memory so status
//! replies and loop re-enqueues do not hit the disk again.
//!
//! Entries expire after `METADATA_TTL` and the cache never holds more than
//! `CACHE_SIZE` entries; the maintenance task calls
//! [`MetadataCache::cleanup_old_entries`] periodically.

pub mod lru_cache;

use lru_cache::LRUCache;
use tracing::info;

use crate::sources::TrackMetadata;

/// Sidecar metadata keyed by media id.
pub type MetadataCache = LRUCache<String, TrackMetadata>;

impl MetadataCache {
    /// Performs cache maintenance by removing expired entries.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
    }
}
