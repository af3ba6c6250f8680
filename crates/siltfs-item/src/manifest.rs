//! Manifest read interface
//!
//! On a coverage miss the cache asks the manifest to search the segments
//! around a key. The reader assembles the items it finds into a batch
//! along with the window of keys the search proved, and the cache
//! absorbs the batch atomically under its lock.

use bytes::Bytes;
use siltfs_common::fmt::MAX_VAL_SIZE;
use siltfs_common::{Error, Key, Result};

/// One item read from segments, owned by the batch until insertion
#[derive(Clone, Debug)]
pub struct BatchEntry {
    pub(crate) key: Key,
    pub(crate) val: Option<Bytes>,
}

/// Items read from segments plus the key window the read proved.
///
/// Every key in `[start, end]` that is absent from the batch is known
/// not to exist in segments; inserting the batch extends the cache's
/// negative coverage by exactly that window. The builder pushes items
/// in ascending key order.
#[derive(Clone, Debug)]
pub struct ReadBatch {
    pub(crate) start: Key,
    pub(crate) end: Key,
    pub(crate) items: Vec<BatchEntry>,
}

impl ReadBatch {
    pub fn new(start: Key, end: Key) -> Self {
        Self {
            start,
            end,
            items: Vec::new(),
        }
    }

    /// Append an item read from a segment.
    pub fn push(&mut self, key: Key, val: Option<Bytes>) -> Result<()> {
        if val.as_ref().is_some_and(|v| v.len() > MAX_VAL_SIZE) {
            return Err(Error::invalid_argument("batch value exceeds MAX_VAL_SIZE"));
        }
        self.items.push(BatchEntry { key, val });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn start(&self) -> &Key {
        &self.start
    }

    pub fn end(&self) -> &Key {
        &self.end
    }

    pub(crate) fn into_parts(self) -> (Key, Key, Vec<BatchEntry>) {
        (self.start, self.end, self.items)
    }
}

/// Index of segments, searched on cache misses.
///
/// `read_items` must return a batch whose window lies within
/// `[start, end]` and covers at least the smallest subrange around
/// `key` the search could determine; the retry loop depends on the
/// returned window actually covering `key`. Errors are surfaced to the
/// caller verbatim and terminate the retry.
pub trait Manifest: Send + Sync {
    fn read_items(&self, key: &Key, start: &Key, end: &Key) -> Result<ReadBatch>;
}

/// Manifest over no segments at all: every read proves the whole lock
/// window empty. Used by tests and by mounts before their first commit.
#[derive(Debug, Default)]
pub struct EmptyManifest;

impl Manifest for EmptyManifest {
    fn read_items(&self, _key: &Key, start: &Key, end: &Key) -> Result<ReadBatch> {
        Ok(ReadBatch::new(*start, *end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_push_checks_value_size() {
        let mut batch = ReadBatch::new(Key::inode(1), Key::inode(9));
        batch.push(Key::inode(1), None).unwrap();
        batch
            .push(Key::inode(2), Some(Bytes::from(vec![0u8; MAX_VAL_SIZE])))
            .unwrap();

        let err = batch
            .push(Key::inode(3), Some(Bytes::from(vec![0u8; MAX_VAL_SIZE + 1])))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_empty_manifest_covers_lock_window() {
        let batch = EmptyManifest
            .read_items(&Key::inode(5), &Key::inode(1), &Key::inode(9))
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(*batch.start(), Key::inode(1));
        assert_eq!(*batch.end(), Key::inode(9));
    }
}
