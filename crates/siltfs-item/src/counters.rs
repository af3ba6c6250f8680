//! Item cache telemetry
//!
//! Closed enumeration of cache events, mirrored by the telemetry bus.
//! All counters are monotonic and lock-free; readers tolerate slight
//! skew against the cache state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one item cache instance
#[derive(Debug, Default)]
pub struct CacheCounters {
    /// Lookups that found a live item
    pub lookup_hit: AtomicU64,
    /// Lookups that found no live item
    pub lookup_miss: AtomicU64,
    /// Coverage checks answered by a cached range
    pub range_hit: AtomicU64,
    /// Coverage checks with no containing range
    pub range_miss: AtomicU64,
    /// Ranges inserted into the coverage map
    pub range_insert: AtomicU64,
    /// Range records freed
    pub range_free: AtomicU64,
    /// Item slots allocated
    pub item_alloc: AtomicU64,
    /// Item slots freed
    pub item_free: AtomicU64,
    /// Items created by callers
    pub create: AtomicU64,
    /// Items turned into deletion tombstones
    pub delete: AtomicU64,
    /// Batch items inserted into the cache
    pub batch_inserted: AtomicU64,
    /// Batch items dropped because a cached item won
    pub batch_duplicate: AtomicU64,
    /// Items evicted by the shrinker
    pub shrink: AtomicU64,
    /// Items evicted that no range covered
    pub shrink_outside: AtomicU64,
    /// Scans that found no usable shrink boundary
    pub shrink_alone: AtomicU64,
    /// Ranges split by the shrinker
    pub shrink_split_range: AtomicU64,
    /// Boundary walks stopped by a dirty neighbor
    pub shrink_next_dirty: AtomicU64,
    /// Boundary walks that reached a range endpoint
    pub shrink_range_end: AtomicU64,
    /// Item-free ranges dropped after a scan
    pub shrink_empty_range: AtomicU64,
    /// Live items appended to a segment
    pub write_item: AtomicU64,
    /// Deletion tombstones appended to a segment
    pub write_deletion_item: AtomicU64,
    /// Writebacks that forced a transaction sync
    pub commit_flush: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Item lookup hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.lookup_hit.load(Ordering::Relaxed);
        let misses = self.lookup_miss.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all counters
    pub fn reset(&self) {
        let all = [
            &self.lookup_hit,
            &self.lookup_miss,
            &self.range_hit,
            &self.range_miss,
            &self.range_insert,
            &self.range_free,
            &self.item_alloc,
            &self.item_free,
            &self.create,
            &self.delete,
            &self.batch_inserted,
            &self.batch_duplicate,
            &self.shrink,
            &self.shrink_outside,
            &self.shrink_alone,
            &self.shrink_split_range,
            &self.shrink_next_dirty,
            &self.shrink_range_end,
            &self.shrink_empty_range,
            &self.write_item,
            &self.write_deletion_item,
            &self.commit_flush,
        ];
        for counter in all {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let counters = CacheCounters::default();
        assert_eq!(counters.hit_ratio(), 0.0);

        CacheCounters::inc(&counters.lookup_hit);
        CacheCounters::inc(&counters.lookup_hit);
        CacheCounters::inc(&counters.lookup_miss);
        CacheCounters::inc(&counters.lookup_miss);
        assert!((counters.hit_ratio() - 0.5).abs() < 0.01);

        counters.reset();
        assert_eq!(counters.lookup_hit.load(Ordering::Relaxed), 0);
        assert_eq!(counters.hit_ratio(), 0.0);
    }
}
