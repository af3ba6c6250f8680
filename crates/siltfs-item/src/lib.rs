//! Siltfs Item Cache
//!
//! This crate implements the item cache that sits between the
//! filesystem's logical item callers and the segment store:
//! - Ordered item tree with an augmented dirty-subtree index
//! - Range-based negative caching of manifest reads
//! - Read-through miss loop under cluster lock leases
//! - Dirty item assembly into segments at transaction commit
//! - LRU shrinking that preserves coverage correctness

pub mod cache;
pub mod counters;
pub mod lock;
pub mod manifest;
pub mod seg;
pub mod trans;

mod lru;
mod pool;
mod range;
mod shrink;
mod tree;

// Re-exports
pub use cache::{ItemCache, ItemCacheStats, SavedList};
pub use counters::CacheCounters;
pub use lock::{ItemLock, LockMode};
pub use manifest::{EmptyManifest, Manifest, ReadBatch};
pub use seg::{fits_single, ItemFlags, SegmentSink};
pub use trans::{NoopTracker, TransTracker};

pub use siltfs_common::{CacheConfig, Error, Key, Result};
