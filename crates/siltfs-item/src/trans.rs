//! Transaction tracker interface
//!
//! The commit driver reserves segment space for dirty items as they
//! accumulate. The cache publishes every change to its dirty accounting
//! and asks the driver to sync when a caller needs a range written out.

use siltfs_common::Result;

/// Commit driver hooks used by the item cache.
pub trait TransTracker: Send + Sync {
    /// Publish a change in dirty accounting. Called with the cache lock
    /// held; implementations must not block or call back into the cache.
    fn track_items(&self, delta_items: i64, delta_bytes: i64);

    /// Commit the current transaction. Returns the number of the
    /// transaction that was written.
    ///
    /// Writeback ordering contract: a call with `wait` must not return
    /// until any commit that was already in flight when it was made has
    /// completed, so a caller that saw dirty items before the call
    /// observes them persistent after it.
    fn sync(&self, wait: bool) -> Result<u64>;
}

/// Tracker for caches with no commit driver attached. Accounting is
/// dropped and sync is a no-op.
#[derive(Debug, Default)]
pub struct NoopTracker;

impl TransTracker for NoopTracker {
    fn track_items(&self, _delta_items: i64, _delta_bytes: i64) {}

    fn sync(&self, _wait: bool) -> Result<u64> {
        Ok(0)
    }
}
