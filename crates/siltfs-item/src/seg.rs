//! Segment append interface
//!
//! At commit the cache streams its dirty items, in key order, into a
//! level-0 segment. The segment writer owns the on-disk format; the
//! cache only needs append and a fit check against the format limits.

use siltfs_common::fmt;
use siltfs_common::Key;

/// Per-item flags carried into the segment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItemFlags {
    deletion: bool,
}

impl ItemFlags {
    pub fn new(deletion: bool) -> Self {
        Self { deletion }
    }

    /// The item is a tombstone deleting a persistent key
    pub fn deletion(&self) -> bool {
        self.deletion
    }
}

/// Sink for sorted dirty items during commit.
pub trait SegmentSink {
    /// Append one item. Returns false when the segment is full; the
    /// commit driver pre-checks with `dirty_fits_single`, so a full
    /// segment mid-stream means the reservation accounting is broken.
    fn append(&mut self, key: &Key, val: Option<&[u8]>, flags: ItemFlags) -> bool;
}

/// True if this many items and value bytes fit in one segment.
pub fn fits_single(nr_items: u64, val_bytes: u64) -> bool {
    fmt::seg_fits_single(nr_items, val_bytes)
}
