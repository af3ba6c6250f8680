//! On-disk format limits
//!
//! The cache never touches the segment format directly, but it sizes its
//! dirty accounting against these limits so a transaction's dirty items
//! are guaranteed to fit in a single level-0 segment.

/// Maximum length of a single item value in bytes
pub const MAX_VAL_SIZE: usize = 1024;

/// Size of one on-disk segment
pub const SEGMENT_SIZE: usize = 1024 * 1024;

/// Bytes consumed by the segment header block
pub const SEGMENT_HEADER_SIZE: usize = 4096;

/// Fixed per-item overhead in a segment: the sorted index entry, the
/// key, and the value offset/length record.
pub const SEGMENT_ITEM_OVERHEAD: usize = 64;

/// True if `nr_items` items carrying `val_bytes` total value bytes fit
/// in a single segment.
pub fn seg_fits_single(nr_items: u64, val_bytes: u64) -> bool {
    let used = (SEGMENT_HEADER_SIZE as u64)
        .saturating_add(nr_items.saturating_mul(SEGMENT_ITEM_OVERHEAD as u64))
        .saturating_add(val_bytes);
    used <= SEGMENT_SIZE as u64
}
