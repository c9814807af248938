use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use super::masonry::{LayoutResult, MasonryLayout};
use super::metrics::LayoutMetrics;
use crate::models::TileId;

/// Default number of cached layouts to keep in memory.
pub const DEFAULT_CACHE_ENTRIES: usize = 8;

/// Layout cache for storing and retrieving finished masonry passes.
///
/// Entries are keyed by a fingerprint of everything the placement depends on:
/// tile ids in document order, the resolved aspect ratio of every tile, and
/// the column metrics. Any change to the list, a ratio, or the computed
/// style produces a new key, so stale entries are simply never hit.
///
/// Results are shared as `Arc<LayoutResult>`; one cache can back several
/// engines (e.g. the live grid and a benchmark run).
pub struct LayoutCache {
    cache: Mutex<LruCache<u64, Arc<LayoutResult>>>,
}

impl LayoutCache {
    /// Creates a cache holding at most `capacity` layouts (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Computes the cache key for a layout pass.
    ///
    /// Ratios are hashed after default substitution so that "unknown" and
    /// "explicitly default" map to the same entry.
    pub fn fingerprint(
        ids: &[TileId],
        aspect_ratios: &HashMap<TileId, f64>,
        layout: &MasonryLayout,
        metrics: &LayoutMetrics,
    ) -> u64 {
        let mut hasher_input = Vec::with_capacity(ids.len() * 32 + 48);

        hasher_input.extend_from_slice(&(metrics.column_count as u64).to_le_bytes());
        for value in [
            metrics.column_width,
            metrics.gap,
            metrics.padding_left,
            metrics.padding_right,
        ] {
            hasher_input.extend_from_slice(&value.to_bits().to_le_bytes());
        }

        for id in ids {
            hasher_input.extend_from_slice(id.as_str().as_bytes());
            // Separator so ("ab","c") and ("a","bc") differ
            hasher_input.push(0);
            let ratio = layout.resolve_aspect(aspect_ratios.get(id).copied());
            hasher_input.extend_from_slice(&ratio.to_bits().to_le_bytes());
        }

        xxh3_64(&hasher_input)
    }

    /// Returns the cached layout for `key`, marking it most recently used.
    pub fn get(&self, key: u64) -> Option<Arc<LayoutResult>> {
        self.cache.lock().get(&key).cloned()
    }

    /// Stores a layout, evicting the least recently used entry at capacity.
    pub fn insert(&self, key: u64, result: Arc<LayoutResult>) {
        self.cache.lock().put(key, result);
    }

    /// Clears the entire cache.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    /// Returns the number of cached layouts.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

impl Default for LayoutCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<TileId> {
        names.iter().map(|n| TileId::from(*n)).collect()
    }

    fn metrics() -> LayoutMetrics {
        LayoutMetrics::from_parts(3, 8.0, 0.0, 0.0, 900.0)
    }

    #[test]
    fn test_fingerprint_consistency() {
        let layout = MasonryLayout::default();
        let tiles = ids(&["a", "b", "c"]);
        let ratios = HashMap::new();
        let hash1 = LayoutCache::fingerprint(&tiles, &ratios, &layout, &metrics());
        let hash2 = LayoutCache::fingerprint(&tiles, &ratios, &layout, &metrics());
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_fingerprint_changes_on_order() {
        let layout = MasonryLayout::default();
        let ratios = HashMap::new();
        let hash1 = LayoutCache::fingerprint(&ids(&["a", "b"]), &ratios, &layout, &metrics());
        let hash2 = LayoutCache::fingerprint(&ids(&["b", "a"]), &ratios, &layout, &metrics());
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_fingerprint_changes_on_ratio_and_metrics() {
        let layout = MasonryLayout::default();
        let tiles = ids(&["a", "b"]);
        let mut ratios = HashMap::new();
        let base = LayoutCache::fingerprint(&tiles, &ratios, &layout, &metrics());

        ratios.insert(tiles[1].clone(), 1.5);
        let with_ratio = LayoutCache::fingerprint(&tiles, &ratios, &layout, &metrics());
        assert_ne!(base, with_ratio);

        let wider = LayoutMetrics::from_parts(4, 8.0, 0.0, 0.0, 900.0);
        let with_columns = LayoutCache::fingerprint(&tiles, &ratios, &layout, &wider);
        assert_ne!(with_ratio, with_columns);
    }

    #[test]
    fn test_fingerprint_treats_default_ratio_as_unknown() {
        let layout = MasonryLayout::default();
        let tiles = ids(&["a"]);
        let mut ratios = HashMap::new();
        let unknown = LayoutCache::fingerprint(&tiles, &ratios, &layout, &metrics());
        ratios.insert(tiles[0].clone(), 1.0);
        let explicit = LayoutCache::fingerprint(&tiles, &ratios, &layout, &metrics());
        assert_eq!(unknown, explicit);
    }

    #[test]
    fn test_cache_miss_then_hit() {
        let cache = LayoutCache::default();
        let layout = MasonryLayout::default();
        let tiles = ids(&["a", "b", "c"]);
        let ratios = HashMap::new();
        let key = LayoutCache::fingerprint(&tiles, &ratios, &layout, &metrics());

        assert!(cache.get(key).is_none());

        let result = Arc::new(layout.compute(&tiles, &ratios, &metrics()));
        cache.insert(key, result.clone());

        let hit = cache.get(key).unwrap();
        assert!(Arc::ptr_eq(&hit, &result));
        assert_eq!(hit.len(), 3);
    }

    #[test]
    fn test_cache_eviction() {
        let cache = LayoutCache::new(4);
        let layout = MasonryLayout::default();
        let result = Arc::new(layout.compute(&[], &HashMap::new(), &metrics()));

        for key in 0..10u64 {
            cache.insert(key, result.clone());
        }

        assert_eq!(cache.len(), 4);
        assert!(cache.get(0).is_none());
        assert!(cache.get(9).is_some());

        cache.clear();
        assert!(cache.is_empty());
    }
}
