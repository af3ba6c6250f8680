//! Configuration types for siltfs
//!
//! This module defines configuration structures used across components.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Item cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of pool slots (items plus cached ranges). Slot
    /// exhaustion surfaces as an out-of-memory error to mutators.
    pub max_slots: usize,
    /// Run a background thread that shrinks the cache when the LRU grows
    /// past the watermark.
    pub background_shrink: bool,
    /// Interval between background shrink checks
    pub shrink_interval: Duration,
    /// LRU length above which the background thread starts shrinking
    pub lru_high_watermark: usize,
    /// Scan target handed to the shrinker per background pass
    pub shrink_batch: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_slots: 1 << 20,
            background_shrink: true,
            shrink_interval: Duration::from_secs(2),
            lru_high_watermark: 1 << 19,
            shrink_batch: 4096,
        }
    }
}

impl CacheConfig {
    /// Create a config with a slot budget, background shrinking disabled
    pub fn with_max_slots(max_slots: usize) -> Self {
        Self {
            max_slots,
            background_shrink: false,
            lru_high_watermark: max_slots / 2,
            ..Default::default()
        }
    }
}
