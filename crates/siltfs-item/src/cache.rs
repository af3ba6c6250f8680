//! The item cache
//!
//! Sits between callers manipulating logical items and the segment
//! store. The cache holds an ordered tree of items and an ordered tree
//! of key ranges that are completely described by those items, so
//! negative lookups inside a cached range are answered without touching
//! the manifest. Deletions of persistent keys become tombstone items
//! that stay in the tree, dirty, until a commit writes them to a
//! segment.
//!
//! Every operation runs under a lock lease from the cluster lock
//! manager and holds the cache mutex only while examining or mutating
//! the trees. A coverage miss releases the mutex, reads items from the
//! manifest, and retries with the state re-examined, since anything may
//! have changed while the read ran.

use crate::counters::CacheCounters;
use crate::lock::{ItemLock, LockMode};
use crate::lru::Lru;
use crate::manifest::{Manifest, ReadBatch};
use crate::pool::{ItemNode, Link, Pool, RangeNode, Slot, SlotId};
use crate::range;
use crate::seg::{fits_single, ItemFlags, SegmentSink};
use crate::shrink;
use crate::trans::TransTracker;
use crate::tree::{self, Augment, DIRTY_SELF};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use siltfs_common::fmt::MAX_VAL_SIZE;
use siltfs_common::{CacheConfig, Error, Key, Result};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

fn check_val(val: &Option<Bytes>) -> Result<()> {
    if val.as_ref().is_some_and(|v| v.len() > MAX_VAL_SIZE) {
        return Err(Error::invalid_argument("value exceeds MAX_VAL_SIZE"));
    }
    Ok(())
}

/// All cache state guarded by the single cache mutex
pub(crate) struct CacheInner {
    pub(crate) pool: Pool,
    pub(crate) items: Link,
    pub(crate) ranges: Link,
    pub(crate) lru: Lru,
    pub(crate) nr_dirty_items: i64,
    pub(crate) dirty_val_bytes: i64,
    rng: SmallRng,
}

impl CacheInner {
    fn new(max_slots: usize) -> Self {
        Self {
            pool: Pool::new(max_slots),
            items: None,
            ranges: None,
            lru: Lru::new(),
            nr_dirty_items: 0,
            dirty_val_bytes: 0,
            rng: SmallRng::from_entropy(),
        }
    }

    pub(crate) fn alloc_item(
        &mut self,
        counters: &CacheCounters,
        key: &Key,
        val: Option<Bytes>,
    ) -> Result<SlotId> {
        let prio = self.rng.gen();
        let id = self.pool.alloc(Slot::Item(ItemNode::new(*key, val, prio)))?;
        CacheCounters::inc(&counters.item_alloc);
        Ok(id)
    }

    pub(crate) fn alloc_range(&mut self, start: Key, end: Key) -> Result<SlotId> {
        let prio = self.rng.gen();
        self.pool.alloc(Slot::Range(RangeNode::new(start, end, prio)))
    }

    /// Free an item slot that was never linked into the tree.
    fn free_unlinked_item(&mut self, counters: &CacheCounters, id: SlotId) {
        self.pool.free(id);
        CacheCounters::inc(&counters.item_free);
    }

    /// Find a live item at the key. Deletion items answer lookups as if
    /// nothing were there; callers that replace tombstones do so through
    /// insert_item.
    fn find_item(&self, counters: &CacheCounters, key: &Key) -> Link {
        let walk = tree::walk_items(&self.pool, self.items, key);
        let found = walk.found.filter(|id| !self.pool.item(*id).deletion);
        if found.is_some() {
            CacheCounters::inc(&counters.lookup_hit);
        } else {
            CacheCounters::inc(&counters.lookup_miss);
        }
        found
    }

    /// Coverage query: the containing range's bounds if the key is
    /// inside one.
    fn check_range(&self, counters: &CacheCounters, key: &Key) -> Option<(Key, Key)> {
        let walk = range::walk_ranges(&self.pool, self.ranges, key);
        match walk.found {
            Some(id) => {
                CacheCounters::inc(&counters.range_hit);
                let rng = self.pool.range(id);
                Some((rng.start, rng.end))
            }
            None => {
                CacheCounters::inc(&counters.range_miss);
                None
            }
        }
    }

    fn item_referenced(&mut self, id: SlotId) {
        if self.pool.item(id).dirty == 0 {
            self.lru.touch(&mut self.pool, id);
        }
    }

    fn update_dirty_counts(&mut self, tracker: &dyn TransTracker, d_items: i64, d_bytes: i64) {
        self.nr_dirty_items += d_items;
        self.dirty_val_bytes += d_bytes;
        debug_assert!(self.nr_dirty_items >= 0 && self.dirty_val_bytes >= 0);
        tracker.track_items(d_items, d_bytes);
    }

    fn mark_item_dirty(&mut self, tracker: &dyn TransTracker, id: SlotId) {
        if self.pool.item(id).dirty & DIRTY_SELF != 0 {
            return;
        }
        self.pool.item_mut(id).dirty |= DIRTY_SELF;
        self.lru.unlink(&mut self.pool, id);

        let len = self.pool.item(id).val_len() as i64;
        self.update_dirty_counts(tracker, 1, len);
        let parent = self.pool.links(id).parent;
        tree::propagate_dirty(&mut self.pool, parent);
    }

    fn clear_item_dirty(&mut self, tracker: &dyn TransTracker, id: SlotId) {
        if self.pool.item(id).dirty & DIRTY_SELF == 0 {
            return;
        }
        self.pool.item_mut(id).dirty &= !DIRTY_SELF;
        self.lru.push_tail(&mut self.pool, id);

        let len = self.pool.item(id).val_len() as i64;
        self.update_dirty_counts(tracker, -1, -len);
        let parent = self.pool.links(id).parent;
        tree::propagate_dirty(&mut self.pool, parent);
    }

    /// Remove an item from the tree, the LRU, and the dirty accounting.
    /// The slot stays allocated for the caller.
    fn unlink_item(&mut self, tracker: &dyn TransTracker, id: SlotId) {
        self.clear_item_dirty(tracker, id);
        tree::erase(&mut self.pool, &mut self.items, id, Augment::Dirty);
        self.lru.unlink(&mut self.pool, id);
    }

    pub(crate) fn erase_item(
        &mut self,
        counters: &CacheCounters,
        tracker: &dyn TransTracker,
        id: SlotId,
    ) {
        self.unlink_item(tracker, id);
        self.pool.free(id);
        CacheCounters::inc(&counters.item_free);
    }

    /// Delete an item from the cache. A non-persistent item is freed
    /// outright; a persistent one keeps only its key and becomes a
    /// dirty deletion tombstone so compaction will drop the old item.
    fn delete_item(&mut self, counters: &CacheCounters, tracker: &dyn TransTracker, id: SlotId) {
        if !self.pool.item(id).persistent {
            self.erase_item(counters, tracker, id);
            return;
        }

        // accounting uses the value length, clear before dropping the value
        self.clear_item_dirty(tracker, id);
        {
            let it = self.pool.item_mut(id);
            it.val = None;
            it.deletion = true;
        }
        self.mark_item_dirty(tracker, id);
        CacheCounters::inc(&counters.delete);
    }

    /// Try to add an item to the tree. Logical writers may clobber
    /// deletion tombstones with a new version of the item; cache
    /// population must never replace anything because the cached item
    /// can be newer than what was just read from segments. Returns
    /// false on conflict, leaving the caller's slot untouched.
    fn insert_item(
        &mut self,
        counters: &CacheCounters,
        tracker: &dyn TransTracker,
        ins: SlotId,
        logical_overwrite: bool,
        cache_populate: bool,
    ) -> bool {
        let key = self.pool.item(ins).key;
        let ins_dirty = self.pool.item(ins).dirty & DIRTY_SELF != 0;

        'restart: loop {
            let mut parent = None;
            let mut right_child = false;
            let mut link = self.items;
            while let Some(id) = link {
                let it_key = self.pool.item(id).key;
                match key.cmp(&it_key) {
                    CmpOrdering::Less => {
                        if ins_dirty {
                            self.pool.item_mut(id).dirty |= tree::DIRTY_LEFT;
                        }
                        parent = Some(id);
                        right_child = false;
                        link = self.pool.links(id).left;
                    }
                    CmpOrdering::Greater => {
                        if ins_dirty {
                            self.pool.item_mut(id).dirty |= tree::DIRTY_RIGHT;
                        }
                        parent = Some(id);
                        right_child = true;
                        link = self.pool.links(id).right;
                    }
                    CmpOrdering::Equal => {
                        let existing = self.pool.item(id);
                        if cache_populate || (!existing.deletion && !logical_overwrite) {
                            return false;
                        }
                        // the replacement inherits the tombstone's
                        // persistence so a later delete still writes a
                        // deletion item
                        if existing.persistent {
                            self.pool.item_mut(ins).persistent = true;
                        }
                        self.erase_item(counters, tracker, id);
                        continue 'restart;
                    }
                }
            }

            tree::link_node(
                &mut self.pool,
                &mut self.items,
                ins,
                parent,
                right_child,
                Augment::Dirty,
            );
            debug_assert!(self.pool.item(ins).dirty & DIRTY_SELF == ins_dirty as u8);
            self.lru.push_tail(&mut self.pool, ins);
            return true;
        }
    }

    fn insert_range_node(&mut self, counters: &CacheCounters, id: SlotId) {
        range::insert_range(&mut self.pool, &mut self.ranges, counters, id);
    }

    fn remove_range_node(&mut self, counters: &CacheCounters, id: SlotId) {
        range::remove_range(&mut self.pool, &mut self.ranges, counters, id);
    }

    /// Next item to return from the iteration interface: at or after
    /// `pos`, not a tombstone, within the cached range and the caller's
    /// limit.
    fn item_for_next(&self, pos: &Key, range_end: &Key, last: &Key) -> Link {
        let limit = if range_end < last { range_end } else { last };
        let walk = tree::walk_items(&self.pool, self.items, pos);
        let mut link = walk.found.or(walk.next);
        while let Some(id) = link {
            let it = self.pool.item(id);
            if it.key > *limit {
                return None;
            }
            if !it.deletion {
                return Some(id);
            }
            link = tree::next_in_order(&self.pool, id);
        }
        None
    }

    fn item_for_prev(&self, pos: &Key, range_start: &Key, first: &Key) -> Link {
        let limit = if range_start > first { range_start } else { first };
        let walk = tree::walk_items(&self.pool, self.items, pos);
        let mut link = walk.found.or(walk.prev);
        while let Some(id) = link {
            let it = self.pool.item(id);
            if it.key < *limit {
                return None;
            }
            if !it.deletion {
                return Some(id);
            }
            link = tree::prev_in_order(&self.pool, id);
        }
        None
    }

    /// True if any SELF-dirty item lies in `[from, end]`.
    fn dirty_item_within(&self, from: &Key, end: &Key) -> bool {
        let walk = tree::walk_items(&self.pool, self.items, from);
        let mut link = walk.found.or(walk.next);
        if let Some(id) = link {
            if self.pool.item(id).dirty & DIRTY_SELF == 0 {
                link = tree::next_dirty(&self.pool, id);
            }
        }
        link.is_some_and(|id| self.pool.item(id).key <= *end)
    }
}

/// An item pulled out of the cache by `delete_save`, preserving dirty
/// state so `restore` can put it back exactly as it was.
#[derive(Debug)]
pub struct SavedItem {
    key: Key,
    val: Option<Bytes>,
    deletion: bool,
    persistent: bool,
    dirty: bool,
}

/// Items saved by `delete_save`, owned by the caller until restored.
#[derive(Debug, Default)]
pub struct SavedList {
    items: Vec<SavedItem>,
}

impl SavedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Point-in-time snapshot of cache occupancy
#[derive(Clone, Debug)]
pub struct ItemCacheStats {
    /// Items resident in the tree, tombstones included
    pub resident_items: usize,
    /// Ranges in the coverage map
    pub cached_ranges: usize,
    /// Clean items eligible for shrinking
    pub lru_len: usize,
    /// Items that must be written at the next commit
    pub nr_dirty_items: i64,
    /// Total value bytes carried by dirty items
    pub dirty_val_bytes: i64,
}

/// Cache of logical items backed by the manifest and segments
pub struct ItemCache {
    inner: Arc<Mutex<CacheInner>>,
    manifest: Arc<dyn Manifest>,
    tracker: Arc<dyn TransTracker>,
    counters: Arc<CacheCounters>,
    config: CacheConfig,
    shutdown: Arc<AtomicBool>,
    shrink_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ItemCache {
    /// Set up a cache. With `background_shrink` configured this also
    /// starts the shrink thread, which runs until the cache is dropped.
    pub fn new(
        config: CacheConfig,
        manifest: Arc<dyn Manifest>,
        tracker: Arc<dyn TransTracker>,
    ) -> Self {
        let cache = Self {
            inner: Arc::new(Mutex::new(CacheInner::new(config.max_slots))),
            manifest,
            tracker,
            counters: Arc::new(CacheCounters::default()),
            config: config.clone(),
            shutdown: Arc::new(AtomicBool::new(false)),
            shrink_handle: Mutex::new(None),
        };
        if config.background_shrink {
            cache.start_background_shrink();
        }
        info!(max_slots = config.max_slots, "item cache ready");
        cache
    }

    fn start_background_shrink(&self) {
        let inner = Arc::clone(&self.inner);
        let counters = Arc::clone(&self.counters);
        let tracker = Arc::clone(&self.tracker);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.shrink_interval;
        let watermark = self.config.lru_high_watermark;
        let batch = self.config.shrink_batch;

        let handle = thread::spawn(move || {
            info!("item cache shrink thread started");

            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                let mut guard = inner.lock();
                let excess = guard.lru.len().saturating_sub(watermark);
                if excess > 0 {
                    let freed =
                        shrink::shrink_scan(&mut guard, &counters, &*tracker, excess.min(batch));
                    debug!(freed, "background shrink pass");
                }
            }

            info!("item cache shrink thread stopped");
        });
        *self.shrink_handle.lock() = Some(handle);
    }

    /// Telemetry counters for this cache
    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    /// Occupancy snapshot
    pub fn stats(&self) -> ItemCacheStats {
        let inner = self.inner.lock();
        ItemCacheStats {
            resident_items: inner.pool.nr_items(),
            cached_ranges: inner.pool.nr_ranges(),
            lru_len: inner.lru.len(),
            nr_dirty_items: inner.nr_dirty_items,
            dirty_val_bytes: inner.dirty_val_bytes,
        }
    }

    /// Read items around `key` from the manifest and absorb them.
    fn read_populate(&self, key: &Key, lock: &ItemLock) -> Result<()> {
        let batch = self.manifest.read_items(key, &lock.start, &lock.end)?;
        self.insert_batch(batch)
    }

    /// Find the item at `key` and return its value. `Ok(None)` is a
    /// present-but-valueless item; a covered key with no item is
    /// `NotFound`.
    pub fn lookup(&self, key: &Key, lock: &ItemLock) -> Result<Option<Bytes>> {
        if !lock.covers(key, LockMode::Read) {
            return Err(Error::invalid_argument("lock does not cover lookup"));
        }

        loop {
            let ret = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if let Some(id) = inner.find_item(&self.counters, key) {
                    inner.item_referenced(id);
                    Ok(inner.pool.item(id).val.clone())
                } else if inner.check_range(&self.counters, key).is_some() {
                    Err(Error::NotFound)
                } else {
                    Err(Error::NeedsRead)
                }
            };
            match ret {
                Err(Error::NeedsRead) => self.read_populate(key, lock)?,
                other => return other,
            }
        }
    }

    /// As `lookup`, but the caller asserts the value is exactly `len`
    /// bytes; any other length is a corruption signal.
    pub fn lookup_exact(&self, key: &Key, len: usize, lock: &ItemLock) -> Result<Option<Bytes>> {
        let val = self.lookup(key, lock)?;
        let got = val.as_ref().map_or(0, |v| v.len());
        if got != len {
            error!(key = %key, got, expected = len, "item value length mismatch");
            return Err(Error::corruption("item value length mismatch"));
        }
        Ok(val)
    }

    /// Return the smallest non-tombstone item with `key <= item <= last`,
    /// reading from the manifest wherever coverage runs out. `NotFound`
    /// means no such item exists within the lock's window; the caller
    /// re-locks to continue past it.
    pub fn next(&self, key: &Key, last: &Key, lock: &ItemLock) -> Result<(Key, Option<Bytes>)> {
        let mut last = *last;
        if lock.end < last {
            last = lock.end;
        }
        if *key > last {
            return Err(Error::NotFound);
        }
        if !lock.covers(key, LockMode::Read) {
            return Err(Error::invalid_argument("lock does not cover next"));
        }

        let mut pos = *key;
        loop {
            let ret = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                loop {
                    let Some((_, range_end)) = inner.check_range(&self.counters, &pos) else {
                        break Err(Error::NeedsRead);
                    };
                    if let Some(id) = inner.item_for_next(&pos, &range_end, &last) {
                        inner.item_referenced(id);
                        let it = inner.pool.item(id);
                        break Ok((it.key, it.val.clone()));
                    }
                    if range_end < last {
                        // keep searching past the empty cached range
                        pos = range_end.incremented();
                        continue;
                    }
                    break Err(Error::NotFound);
                }
            };
            match ret {
                Err(Error::NeedsRead) => self.read_populate(&pos, lock)?,
                other => return other,
            }
        }
    }

    /// Mirror of `next`: the largest non-tombstone item with
    /// `first <= item <= key`.
    pub fn prev(&self, key: &Key, first: &Key, lock: &ItemLock) -> Result<(Key, Option<Bytes>)> {
        let mut first = *first;
        if lock.start > first {
            first = lock.start;
        }
        if *key < first {
            return Err(Error::NotFound);
        }
        if !lock.covers(key, LockMode::Read) {
            return Err(Error::invalid_argument("lock does not cover prev"));
        }

        let mut pos = *key;
        loop {
            let ret = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                loop {
                    let Some((range_start, _)) = inner.check_range(&self.counters, &pos) else {
                        break Err(Error::NeedsRead);
                    };
                    if let Some(id) = inner.item_for_prev(&pos, &range_start, &first) {
                        inner.item_referenced(id);
                        let it = inner.pool.item(id);
                        break Ok((it.key, it.val.clone()));
                    }
                    if range_start > first {
                        pos = range_start.decremented();
                        continue;
                    }
                    break Err(Error::NotFound);
                }
            };
            match ret {
                Err(Error::NeedsRead) => self.read_populate(&pos, lock)?,
                other => return other,
            }
        }
    }

    /// Create a new dirty item. `AlreadyExists` if a live item is
    /// cached at the key; a deletion tombstone is replaced in place.
    pub fn create(&self, key: &Key, val: Option<Bytes>, lock: &ItemLock) -> Result<()> {
        check_val(&val)?;
        if !lock.covers(key, LockMode::Write) {
            return Err(Error::invalid_argument("lock does not cover create"));
        }

        loop {
            let ret = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if inner.check_range(&self.counters, key).is_none() {
                    Err(Error::NeedsRead)
                } else {
                    let id = inner.alloc_item(&self.counters, key, val.clone())?;
                    if inner.insert_item(&self.counters, &*self.tracker, id, false, false) {
                        CacheCounters::inc(&self.counters.create);
                        inner.mark_item_dirty(&*self.tracker, id);
                        Ok(())
                    } else {
                        inner.free_unlinked_item(&self.counters, id);
                        Err(Error::AlreadyExists)
                    }
                }
            };
            match ret {
                Err(Error::NeedsRead) => self.read_populate(key, lock)?,
                other => return other,
            }
        }
    }

    /// Create an item without reading first, overwriting whatever is
    /// cached. The caller asserts the overwrite is correct; the new
    /// item is forced persistent so a later delete still writes a
    /// tombstone.
    pub fn create_force(&self, key: &Key, val: Option<Bytes>, lock: &ItemLock) -> Result<()> {
        check_val(&val)?;
        if !lock.covers(key, LockMode::WriteOnly) {
            return Err(Error::invalid_argument("lock does not cover create_force"));
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = inner.alloc_item(&self.counters, key, val)?;
        inner.pool.item_mut(id).persistent = true;
        if !inner.insert_item(&self.counters, &*self.tracker, id, true, false) {
            inner.free_unlinked_item(&self.counters, id);
            error!(key = %key, "item cache corrupted: create_force could not install item");
            return Err(Error::corruption("create_force found an unremovable item"));
        }
        CacheCounters::inc(&self.counters.create);
        inner.mark_item_dirty(&*self.tracker, id);
        Ok(())
    }

    /// Replace the value of an existing item and mark it dirty.
    pub fn update(&self, key: &Key, val: Option<Bytes>, lock: &ItemLock) -> Result<()> {
        check_val(&val)?;
        if !lock.covers(key, LockMode::Write) {
            return Err(Error::invalid_argument("lock does not cover update"));
        }

        loop {
            let ret = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if let Some(id) = inner.find_item(&self.counters, key) {
                    inner.clear_item_dirty(&*self.tracker, id);
                    inner.pool.item_mut(id).val = val.clone();
                    inner.mark_item_dirty(&*self.tracker, id);
                    Ok(())
                } else if inner.check_range(&self.counters, key).is_some() {
                    Err(Error::NotFound)
                } else {
                    Err(Error::NeedsRead)
                }
            };
            match ret {
                Err(Error::NeedsRead) => self.read_populate(key, lock)?,
                other => return other,
            }
        }
    }

    /// Overwrite the value of an item the caller has already dirtied
    /// in this transaction. The value must not grow; the dirty
    /// reservation was sized by the old length.
    pub fn update_dirty(&self, key: &Key, val: Option<Bytes>) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(id) = inner.find_item(&self.counters, key) else {
            error!(key = %key, "update_dirty of a missing item");
            return Err(Error::corruption("update_dirty of a missing item"));
        };

        let it = inner.pool.item(id);
        let old_len = it.val_len();
        let new_len = val.as_ref().map_or(0, |v| v.len());
        if it.dirty & DIRTY_SELF == 0 || new_len > old_len {
            error!(key = %key, "update_dirty of a clean or smaller item");
            return Err(Error::corruption("update_dirty of a clean or smaller item"));
        }

        inner.pool.item_mut(id).val = val;
        inner.update_dirty_counts(&*self.tracker, 0, new_len as i64 - old_len as i64);
        Ok(())
    }

    /// Make sure an existing item is dirty and pinned for the current
    /// transaction without changing its value.
    pub fn dirty(&self, key: &Key, lock: &ItemLock) -> Result<()> {
        if !lock.covers(key, LockMode::Write) {
            return Err(Error::invalid_argument("lock does not cover dirty"));
        }

        loop {
            let ret = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if let Some(id) = inner.find_item(&self.counters, key) {
                    inner.mark_item_dirty(&*self.tracker, id);
                    Ok(())
                } else if inner.check_range(&self.counters, key).is_some() {
                    Err(Error::NotFound)
                } else {
                    Err(Error::NeedsRead)
                }
            };
            match ret {
                Err(Error::NeedsRead) => self.read_populate(key, lock)?,
                other => return other,
            }
        }
    }

    /// Delete the item at `key`. A never-committed item is freed; a
    /// persistent one becomes a dirty tombstone. `NotFound` forces
    /// callers to read an item before deleting it, which keeps
    /// userspace from minting tombstones for keys that never existed.
    pub fn delete(&self, key: &Key, lock: &ItemLock) -> Result<()> {
        if !lock.covers(key, LockMode::Write) {
            return Err(Error::invalid_argument("lock does not cover delete"));
        }

        loop {
            let ret = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if let Some(id) = inner.find_item(&self.counters, key) {
                    inner.delete_item(&self.counters, &*self.tracker, id);
                    Ok(())
                } else if inner.check_range(&self.counters, key).is_some() {
                    Err(Error::NotFound)
                } else {
                    Err(Error::NeedsRead)
                }
            };
            match ret {
                Err(Error::NeedsRead) => self.read_populate(key, lock)?,
                other => return other,
            }
        }
    }

    /// Install a deletion tombstone without reading the existing item.
    /// The caller knows the key exists in segments and skips the read.
    pub fn delete_force(&self, key: &Key, lock: &ItemLock) -> Result<()> {
        if !lock.covers(key, LockMode::WriteOnly) {
            return Err(Error::invalid_argument("lock does not cover delete_force"));
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = inner.alloc_item(&self.counters, key, None)?;
        inner.pool.item_mut(id).persistent = true;
        if !inner.insert_item(&self.counters, &*self.tracker, id, true, false) {
            inner.free_unlinked_item(&self.counters, id);
            error!(key = %key, "item cache corrupted: delete_force could not install item");
            return Err(Error::corruption("delete_force found an unremovable item"));
        }
        CacheCounters::inc(&self.counters.create);
        inner.mark_item_dirty(&*self.tracker, id);
        inner.delete_item(&self.counters, &*self.tracker, id);
        Ok(())
    }

    /// Delete an item the caller created or dirtied under its held
    /// locks and transaction. Nothing to read, nothing to fail.
    pub fn delete_dirty(&self, key: &Key) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(id) = inner.find_item(&self.counters, key) {
            inner.delete_item(&self.counters, &*self.tracker, id);
        }
    }

    /// Pull the item at `key` out of the cache onto the caller's list,
    /// preserving its dirty state, and leave a tombstone in its place.
    pub fn delete_save(&self, key: &Key, list: &mut SavedList, lock: &ItemLock) -> Result<()> {
        if !lock.covers(key, LockMode::Write) {
            return Err(Error::invalid_argument("lock does not cover delete_save"));
        }

        loop {
            let ret = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if let Some(id) = inner.find_item(&self.counters, key) {
                    let was_dirty = inner.pool.item(id).dirty & DIRTY_SELF != 0;
                    let del = inner.alloc_item(&self.counters, key, None)?;

                    inner.unlink_item(&*self.tracker, id);
                    let node = inner.pool.free_item(id);
                    CacheCounters::inc(&self.counters.item_free);

                    inner.pool.item_mut(del).persistent = node.persistent;
                    list.items.push(SavedItem {
                        key: node.key,
                        val: node.val,
                        deletion: node.deletion,
                        persistent: node.persistent,
                        dirty: was_dirty,
                    });

                    // the key was just removed, the tombstone cannot conflict
                    if inner.insert_item(&self.counters, &*self.tracker, del, false, false) {
                        inner.delete_item(&self.counters, &*self.tracker, del);
                        Ok(())
                    } else {
                        inner.free_unlinked_item(&self.counters, del);
                        Err(Error::corruption("delete_save tombstone conflict"))
                    }
                } else if inner.check_range(&self.counters, key).is_some() {
                    Err(Error::NotFound)
                } else {
                    Err(Error::NeedsRead)
                }
            };
            match ret {
                Err(Error::NeedsRead) => self.read_populate(key, lock)?,
                other => return other,
            }
        }
    }

    /// Reinsert items saved by `delete_save`, remarking the ones that
    /// were dirty. The caller must still hold locks covering every
    /// saved key and the cached ranges must still cover them; restored
    /// items completely overwrite whatever is cached.
    pub fn restore(&self, list: &mut SavedList, lock: &ItemLock) -> Result<()> {
        if list.items.is_empty() {
            return Ok(());
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        for saved in &list.items {
            let mode = if saved.dirty {
                LockMode::Write
            } else {
                LockMode::Read
            };
            if !lock.covers(&saved.key, mode)
                || inner.check_range(&self.counters, &saved.key).is_none()
            {
                return Err(Error::invalid_argument(
                    "restore outside lock or cache coverage",
                ));
            }
        }
        if inner.pool.available() < list.items.len() {
            return Err(Error::out_of_memory("no slots to restore saved items"));
        }

        for saved in list.items.drain(..) {
            if let Some(existing) = inner.find_item(&self.counters, &saved.key) {
                inner.erase_item(&self.counters, &*self.tracker, existing);
            }
            let id = inner.alloc_item(&self.counters, &saved.key, saved.val)?;
            {
                let it = inner.pool.item_mut(id);
                it.deletion = saved.deletion;
                it.persistent = saved.persistent;
            }
            if !inner.insert_item(&self.counters, &*self.tracker, id, false, false) {
                inner.free_unlinked_item(&self.counters, id);
                return Err(Error::corruption("restore conflict"));
            }
            if saved.dirty {
                inner.mark_item_dirty(&*self.tracker, id);
            }
        }
        Ok(())
    }

    /// Atomically absorb a manifest read: extend coverage by the batch
    /// window and populate its items. A cached item always wins over a
    /// batch duplicate, it may carry a newer write that landed while
    /// the unlocked read ran.
    pub fn insert_batch(&self, batch: ReadBatch) -> Result<()> {
        if batch.start() > batch.end() {
            return Err(Error::invalid_argument("batch window start beyond end"));
        }
        let (start, end, entries) = batch.into_parts();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // all or nothing: partially populating under an extended range
        // would fabricate negative lookups for the dropped items
        if inner.pool.available() < entries.len() + 1 {
            return Err(Error::out_of_memory("no slots for manifest batch"));
        }

        let rng = inner.alloc_range(start, end)?;
        inner.insert_range_node(&self.counters, rng);

        for entry in entries {
            let id = inner.alloc_item(&self.counters, &entry.key, entry.val)?;
            inner.pool.item_mut(id).persistent = true;
            if inner.insert_item(&self.counters, &*self.tracker, id, false, true) {
                CacheCounters::inc(&self.counters.batch_inserted);
            } else {
                inner.free_unlinked_item(&self.counters, id);
                CacheCounters::inc(&self.counters.batch_duplicate);
            }
        }
        Ok(())
    }

    /// True if any item is waiting to be written
    pub fn has_dirty(&self) -> bool {
        self.inner.lock().nr_dirty_items != 0
    }

    /// True if the current dirty items plus `nr_extra` more carrying
    /// `bytes_extra` value bytes still fit in a single segment.
    pub fn dirty_fits_single(&self, nr_extra: u64, bytes_extra: u64) -> bool {
        let inner = self.inner.lock();
        fits_single(
            (inner.nr_dirty_items as u64).saturating_add(nr_extra),
            (inner.dirty_val_bytes as u64).saturating_add(bytes_extra),
        )
    }

    /// True if the cache covers any part of `[start, end]`; with
    /// `dirty` set, only if a dirty item lies within it.
    pub fn range_cached(&self, start: &Key, end: &Key, dirty: bool) -> bool {
        let inner = self.inner.lock();
        if dirty {
            inner.dirty_item_within(start, end)
        } else {
            let walk = range::walk_ranges(&inner.pool, inner.ranges, start);
            walk.found.is_some()
                || walk
                    .next
                    .is_some_and(|id| inner.pool.range(id).start <= *end)
        }
    }

    /// Fill a segment with the dirty items in ascending key order.
    /// Written items become clean and persistent; written tombstones
    /// leave the cache entirely.
    pub fn dirty_seg(&self, seg: &mut dyn SegmentSink) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut link = tree::first_dirty(&inner.pool, inner.items);
        while let Some(id) = link {
            let (key, deletion, appended) = {
                let it = inner.pool.item(id);
                let appended = seg.append(&it.key, it.val.as_deref(), ItemFlags::new(it.deletion));
                (it.key, it.deletion, appended)
            };
            // the transaction reservation limited what could get dirty
            if !appended {
                error!(key = %key, "segment filled under a transaction reservation");
                return Err(Error::corruption("dirty items overflow a single segment"));
            }
            if deletion {
                CacheCounters::inc(&self.counters.write_deletion_item);
            } else {
                CacheCounters::inc(&self.counters.write_item);
            }
            debug_assert!(!deletion || inner.pool.item(id).persistent);

            inner.clear_item_dirty(&*self.tracker, id);
            inner.pool.item_mut(id).persistent = true;

            link = tree::next_dirty(&inner.pool, id);
            if deletion {
                inner.erase_item(&self.counters, &*self.tracker, id);
            }
        }
        Ok(())
    }

    /// Write out any dirty items within the range by syncing the
    /// transaction. Returns the number of dirty items that were queued
    /// when the sync was issued, or zero if the range was clean.
    pub fn writeback(&self, start: &Key, end: &Key) -> Result<usize> {
        let count = {
            let inner = self.inner.lock();
            if inner.nr_dirty_items > 0 && inner.dirty_item_within(start, end) {
                inner.nr_dirty_items as usize
            } else {
                0
            }
        };

        if count > 0 {
            CacheCounters::inc(&self.counters.commit_flush);
            self.tracker.sync(true)?;
        }
        Ok(count)
    }

    /// Drop all items within the range and remove it from the coverage
    /// map. The caller is responsible for the range holding no dirty
    /// items. Returns the number of items dropped.
    pub fn invalidate(&self, start: &Key, end: &Key) -> Result<usize> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let rem = inner.alloc_range(*start, *end)?;
        let mut count = 0;

        let walk = tree::walk_items(&inner.pool, inner.items, start);
        let mut link = walk.found.or(walk.next);
        while let Some(id) = link {
            if inner.pool.item(id).key > *end {
                break;
            }
            let next = tree::next_in_order(&inner.pool, id);
            if inner.pool.item(id).dirty & DIRTY_SELF != 0 {
                warn!(key = %inner.pool.item(id).key, "invalidating a dirty item");
            }
            inner.erase_item(&self.counters, &*self.tracker, id);
            count += 1;
            link = next;
        }

        inner.remove_range_node(&self.counters, rem);
        Ok(count)
    }

    /// Reclaim clean items, preserving coverage correctness by
    /// trimming or splitting the ranges around everything evicted.
    /// Returns the number of items freed.
    pub fn shrink(&self, nr_to_scan: usize) -> usize {
        let mut guard = self.inner.lock();
        shrink::shrink_scan(&mut guard, &self.counters, &*self.tracker, nr_to_scan)
    }

    /// Endpoints of the cached ranges starting at the first range
    /// intersecting or following `key`, at most `nr` keys.
    pub fn range_keys_since(&self, key: &Key, nr: usize) -> Vec<Key> {
        let inner = self.inner.lock();
        range::keys_since(&inner.pool, inner.ranges, key, nr)
    }

    /// Keys of cached non-tombstone items from `key` on, at most `nr`.
    pub fn item_keys_since(&self, key: &Key, nr: usize) -> Vec<Key> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(nr.min(64));
        let walk = tree::walk_items(&inner.pool, inner.items, key);
        let mut link = walk.found.or(walk.next);
        while let Some(id) = link {
            if out.len() == nr {
                break;
            }
            let it = inner.pool.item(id);
            if !it.deletion {
                out.push(it.key);
            }
            link = tree::next_in_order(&inner.pool, id);
        }
        out
    }
}

impl Drop for ItemCache {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.shrink_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicI64, AtomicU64};
    use std::sync::mpsc;
    use std::time::Duration;

    fn k(ino: u64) -> Key {
        Key::inode(ino)
    }

    fn val(s: &str) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(s.as_bytes()))
    }

    type ReadHook = Box<dyn FnMut(&Key, &Key, &Key) -> Result<ReadBatch> + Send>;

    /// Manifest double: counts reads, default answer proves the whole
    /// lock window empty, a hook can script anything else.
    #[derive(Default)]
    struct TestManifest {
        reads: AtomicU64,
        hook: Mutex<Option<ReadHook>>,
    }

    impl TestManifest {
        fn with_hook(
            hook: impl FnMut(&Key, &Key, &Key) -> Result<ReadBatch> + Send + 'static,
        ) -> Arc<Self> {
            let manifest = Self::default();
            *manifest.hook.lock() = Some(Box::new(hook));
            Arc::new(manifest)
        }

        fn reads(&self) -> u64 {
            self.reads.load(Ordering::Relaxed)
        }
    }

    impl Manifest for TestManifest {
        fn read_items(&self, key: &Key, start: &Key, end: &Key) -> Result<ReadBatch> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            if let Some(hook) = self.hook.lock().as_mut() {
                return hook(key, start, end);
            }
            Ok(ReadBatch::new(*start, *end))
        }
    }

    /// Tracker double recording accounting deltas and syncs
    #[derive(Debug, Default)]
    struct TestTracker {
        items: AtomicI64,
        bytes: AtomicI64,
        syncs: AtomicU64,
    }

    impl TransTracker for TestTracker {
        fn track_items(&self, delta_items: i64, delta_bytes: i64) {
            self.items.fetch_add(delta_items, Ordering::Relaxed);
            self.bytes.fetch_add(delta_bytes, Ordering::Relaxed);
        }

        fn sync(&self, _wait: bool) -> Result<u64> {
            self.syncs.fetch_add(1, Ordering::Relaxed);
            Ok(1)
        }
    }

    /// Segment double collecting appended records
    struct TestSegment {
        records: Vec<(Key, Option<Vec<u8>>, bool)>,
        capacity: usize,
    }

    impl TestSegment {
        fn new() -> Self {
            Self {
                records: Vec::new(),
                capacity: usize::MAX,
            }
        }

        fn with_capacity(capacity: usize) -> Self {
            Self {
                records: Vec::new(),
                capacity,
            }
        }
    }

    impl SegmentSink for TestSegment {
        fn append(&mut self, key: &Key, val: Option<&[u8]>, flags: ItemFlags) -> bool {
            if self.records.len() >= self.capacity {
                return false;
            }
            self.records
                .push((*key, val.map(<[u8]>::to_vec), flags.deletion()));
            true
        }
    }

    struct Fixture {
        cache: ItemCache,
        manifest: Arc<TestManifest>,
        tracker: Arc<TestTracker>,
    }

    fn fixture() -> Fixture {
        fixture_with(CacheConfig::with_max_slots(1024), Arc::default())
    }

    fn fixture_with(config: CacheConfig, manifest: Arc<TestManifest>) -> Fixture {
        let tracker = Arc::new(TestTracker::default());
        let cache = ItemCache::new(
            config,
            Arc::clone(&manifest) as Arc<dyn Manifest>,
            Arc::clone(&tracker) as Arc<dyn TransTracker>,
        );
        Fixture {
            cache,
            manifest,
            tracker,
        }
    }

    fn wlock(start: u64, end: u64) -> ItemLock {
        ItemLock::write(k(start), k(end))
    }

    fn rlock(start: u64, end: u64) -> ItemLock {
        ItemLock::read(k(start), k(end))
    }

    fn batch(range: (u64, u64), items: &[(u64, &str)]) -> ReadBatch {
        let mut batch = ReadBatch::new(k(range.0), k(range.1));
        for (ino, v) in items {
            batch.push(k(*ino), val(v)).unwrap();
        }
        batch
    }

    #[test]
    fn test_create_then_lookup_roundtrip() {
        let f = fixture();
        let lock = wlock(0, 9);

        f.cache.create(&k(1), val("A"), &lock).unwrap();
        assert_eq!(f.cache.lookup(&k(1), &lock).unwrap(), val("A"));
        // the empty manifest proved the window, one read was enough
        assert_eq!(f.manifest.reads(), 1);
    }

    #[test]
    fn test_create_conflict() {
        let f = fixture();
        let lock = wlock(0, 9);

        f.cache.create(&k(1), val("A"), &lock).unwrap();
        let err = f.cache.create(&k(1), val("B"), &lock).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
        assert_eq!(f.cache.lookup(&k(1), &lock).unwrap(), val("A"));
    }

    #[test]
    fn test_update_roundtrip() {
        let f = fixture();
        let lock = wlock(0, 9);

        f.cache.create(&k(1), val("A"), &lock).unwrap();
        f.cache.update(&k(1), val("A2"), &lock).unwrap();
        assert_eq!(f.cache.lookup(&k(1), &lock).unwrap(), val("A2"));

        let err = f.cache.update(&k(2), val("B"), &lock).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn test_lock_coverage_is_enforced() {
        let f = fixture();

        let err = f.cache.create(&k(1), val("A"), &rlock(0, 9)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = f.cache.lookup(&k(50), &rlock(0, 9)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = f
            .cache
            .create_force(&k(1), val("A"), &wlock(0, 9))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_oversized_value_is_rejected() {
        let f = fixture();
        let big = Some(Bytes::from(vec![0u8; MAX_VAL_SIZE + 1]));
        let err = f.cache.create(&k(1), big, &wlock(0, 9)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_tombstone_lifecycle() {
        // scenario: create, commit, delete, observe the tombstone flush
        let f = fixture();
        let lock = wlock(0, 9);

        f.cache.create(&k(1), val("A"), &lock).unwrap();
        let (key, v) = f.cache.next(&k(0), &k(9), &lock).unwrap();
        assert_eq!((key, v), (k(1), val("A")));

        // first commit makes the item persistent
        let mut seg = TestSegment::new();
        f.cache.dirty_seg(&mut seg).unwrap();
        assert_eq!(seg.records.len(), 1);
        assert!(!seg.records[0].2);

        f.cache.delete(&k(1), &lock).unwrap();
        assert!(matches!(
            f.cache.lookup(&k(1), &lock).unwrap_err(),
            Error::NotFound
        ));
        // the tombstone stays dirty until the next commit
        assert!(f.cache.has_dirty());
        assert!(f.cache.range_cached(&k(0), &k(9), true));

        let mut seg = TestSegment::new();
        f.cache.dirty_seg(&mut seg).unwrap();
        assert_eq!(seg.records.len(), 1);
        assert_eq!(seg.records[0].0, k(1));
        assert!(seg.records[0].2, "second commit writes a deletion record");

        // the tombstone left the cache with the flush
        assert!(!f.cache.range_cached(&k(0), &k(9), true));
        assert_eq!(f.cache.stats().resident_items, 0);
        assert!(matches!(
            f.cache.lookup(&k(1), &lock).unwrap_err(),
            Error::NotFound
        ));
    }

    #[test]
    fn test_delete_of_fresh_item_writes_nothing() {
        let f = fixture();
        let lock = wlock(0, 9);

        f.cache.create(&k(1), val("A"), &lock).unwrap();
        f.cache.delete(&k(1), &lock).unwrap();
        assert!(!f.cache.has_dirty());

        let mut seg = TestSegment::new();
        f.cache.dirty_seg(&mut seg).unwrap();
        assert!(seg.records.is_empty());
    }

    #[test]
    fn test_negative_lookup_inside_coverage() {
        // scenario: batch coverage answers misses without the manifest
        let f = fixture();

        f.cache
            .insert_batch(batch((2, 4), &[(2, "B"), (4, "D")]))
            .unwrap();

        let lock = rlock(2, 4);
        assert!(matches!(
            f.cache.lookup(&k(3), &lock).unwrap_err(),
            Error::NotFound
        ));
        assert_eq!(f.manifest.reads(), 0);

        // outside the covered window the miss loop reads
        let lock = rlock(0, 9);
        assert!(matches!(
            f.cache.lookup(&k(5), &lock).unwrap_err(),
            Error::NotFound
        ));
        assert_eq!(f.manifest.reads(), 1);
        assert!(f.cache.counters().range_miss.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_batch_ranges_merge() {
        let f = fixture();
        f.cache.insert_batch(batch((0, 3), &[])).unwrap();
        f.cache.insert_batch(batch((2, 5), &[])).unwrap();

        assert_eq!(
            f.cache.range_keys_since(&Key::zeros(), 8),
            vec![k(0), k(5)]
        );
        assert_eq!(f.cache.stats().cached_ranges, 1);
    }

    #[test]
    fn test_batch_duplicate_loses_to_cached_item() {
        let f = fixture();
        let only = ItemLock::write_only(k(0), k(9));

        f.cache.create_force(&k(5), val("fresh"), &only).unwrap();
        f.cache
            .insert_batch(batch((0, 9), &[(5, "stale")]))
            .unwrap();

        assert_eq!(f.cache.lookup(&k(5), &rlock(0, 9)).unwrap(), val("fresh"));
        assert_eq!(f.cache.counters().batch_duplicate.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_racing_create_force_wins_over_read() {
        // thread A misses and reads; create_force lands while the read
        // runs; A's retry sees the fresh item win over the batch
        let (ready_tx, ready_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let manifest = TestManifest::with_hook(move |_key, start, end| {
            ready_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            let mut batch = ReadBatch::new(*start, *end);
            batch
                .push(Key::inode(5), Some(Bytes::from_static(b"stale")))
                .unwrap();
            Ok(batch)
        });
        let f = fixture_with(CacheConfig::with_max_slots(1024), manifest);
        let cache = Arc::new(f.cache);

        let reader = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.lookup(&Key::inode(5), &ItemLock::read(Key::inode(0), Key::inode(9))))
        };

        ready_rx.recv().unwrap();
        cache
            .create_force(&k(5), val("racer"), &ItemLock::write_only(k(0), k(9)))
            .unwrap();
        go_tx.send(()).unwrap();

        let got = reader.join().unwrap().unwrap();
        assert_eq!(got, val("racer"));
        assert_eq!(cache.counters().batch_duplicate.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_manifest_error_stops_the_miss_loop() {
        let manifest = TestManifest::with_hook(|_, _, _| {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "segment unreadable",
            )))
        });
        let f = fixture_with(CacheConfig::with_max_slots(64), manifest);

        let err = f.cache.lookup(&k(1), &rlock(0, 9)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(f.manifest.reads(), 1);
    }

    #[test]
    fn test_next_skips_tombstones_and_crosses_ranges() {
        let f = fixture();
        let lock = wlock(0, 20);

        f.cache
            .insert_batch(batch((0, 9), &[(2, "B"), (4, "D")]))
            .unwrap();
        f.cache
            .insert_batch(batch((15, 20), &[(16, "Q")]))
            .unwrap();
        f.cache.delete(&k(2), &lock).unwrap();

        // 2 is a tombstone now, iteration starts at 4
        let (key, v) = f.cache.next(&k(0), &k(20), &lock).unwrap();
        assert_eq!((key, v), (k(4), val("D")));

        // the gap between ranges triggers a read, then iteration
        // continues into the second range
        let reads_before = f.manifest.reads();
        let (key, v) = f.cache.next(&k(5), &k(20), &lock).unwrap();
        assert_eq!((key, v), (k(16), val("Q")));
        assert!(f.manifest.reads() > reads_before);

        assert!(matches!(
            f.cache.next(&k(17), &k(20), &lock).unwrap_err(),
            Error::NotFound
        ));
    }

    #[test]
    fn test_prev_mirrors_next() {
        let f = fixture();
        let lock = wlock(0, 20);

        f.cache
            .insert_batch(batch((0, 20), &[(2, "B"), (4, "D"), (16, "Q")]))
            .unwrap();
        f.cache.delete(&k(16), &lock).unwrap();

        let (key, v) = f.cache.prev(&k(20), &k(0), &lock).unwrap();
        assert_eq!((key, v), (k(4), val("D")));

        let (key, v) = f.cache.prev(&k(3), &k(0), &lock).unwrap();
        assert_eq!((key, v), (k(2), val("B")));

        assert!(matches!(
            f.cache.prev(&k(1), &k(0), &lock).unwrap_err(),
            Error::NotFound
        ));
    }

    #[test]
    fn test_iteration_is_clamped_to_the_lock() {
        let f = fixture();
        f.cache
            .insert_batch(batch((0, 20), &[(4, "D"), (16, "Q")]))
            .unwrap();

        // 16 exists but sits outside the lock, iteration stops
        let lock = rlock(0, 9);
        let (key, _) = f.cache.next(&k(0), &k(20), &lock).unwrap();
        assert_eq!(key, k(4));
        assert!(matches!(
            f.cache.next(&k(5), &k(20), &lock).unwrap_err(),
            Error::NotFound
        ));
    }

    #[test]
    fn test_batch_roundtrip() {
        let f = fixture();
        f.cache.insert_batch(batch((7, 7), &[(7, "G")])).unwrap();
        assert_eq!(f.cache.lookup(&k(7), &rlock(7, 7)).unwrap(), val("G"));
        assert_eq!(f.manifest.reads(), 0);
    }

    #[test]
    fn test_inverted_batch_window_is_rejected() {
        let f = fixture();
        let err = f.cache.insert_batch(batch((9, 0), &[])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_delete_save_restore_roundtrip() {
        let f = fixture();
        let lock = wlock(0, 9);
        let mut list = SavedList::new();

        f.cache.create(&k(1), val("A"), &lock).unwrap();
        f.cache.delete_save(&k(1), &mut list, &lock).unwrap();
        assert_eq!(list.len(), 1);
        assert!(matches!(
            f.cache.lookup(&k(1), &lock).unwrap_err(),
            Error::NotFound
        ));

        f.cache.restore(&mut list, &lock).unwrap();
        assert!(list.is_empty());
        assert_eq!(f.cache.lookup(&k(1), &lock).unwrap(), val("A"));
        // the item was dirty when saved and is dirty again
        assert!(f.cache.has_dirty());
        assert_eq!(f.cache.stats().nr_dirty_items, 1);
    }

    #[test]
    fn test_delete_save_of_persistent_item_leaves_tombstone() {
        let f = fixture();
        let lock = wlock(0, 9);
        let mut list = SavedList::new();

        f.cache.create(&k(1), val("A"), &lock).unwrap();
        f.cache.dirty_seg(&mut TestSegment::new()).unwrap();

        f.cache.delete_save(&k(1), &mut list, &lock).unwrap();
        // a persistent key needs its deletion written
        assert!(f.cache.has_dirty());

        let mut seg = TestSegment::new();
        f.cache.dirty_seg(&mut seg).unwrap();
        assert_eq!(seg.records.len(), 1);
        assert!(seg.records[0].2);
    }

    #[test]
    fn test_restore_requires_lock_and_coverage() {
        let f = fixture();
        let lock = wlock(0, 9);
        let mut list = SavedList::new();

        f.cache.create(&k(1), val("A"), &lock).unwrap();
        f.cache.delete_save(&k(1), &mut list, &lock).unwrap();

        let err = f.cache.restore(&mut list, &rlock(0, 9)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(list.len(), 1, "a refused restore leaves the list intact");

        f.cache.restore(&mut list, &lock).unwrap();
        assert_eq!(f.cache.lookup(&k(1), &lock).unwrap(), val("A"));
    }

    #[test]
    fn test_dirty_accounting() {
        let f = fixture();
        let lock = wlock(0, 99);

        f.cache.create(&k(1), val("ab"), &lock).unwrap();
        f.cache.create(&k(2), val("cdef"), &lock).unwrap();
        f.cache.create(&k(3), None, &lock).unwrap();

        let stats = f.cache.stats();
        assert_eq!(stats.nr_dirty_items, 3);
        assert_eq!(stats.dirty_val_bytes, 6);
        assert_eq!(f.tracker.items.load(Ordering::Relaxed), 3);
        assert_eq!(f.tracker.bytes.load(Ordering::Relaxed), 6);

        // updates re-account the value length
        f.cache.update(&k(2), val("cd"), &lock).unwrap();
        assert_eq!(f.cache.stats().dirty_val_bytes, 4);

        f.cache.dirty_seg(&mut TestSegment::new()).unwrap();
        let stats = f.cache.stats();
        assert_eq!(stats.nr_dirty_items, 0);
        assert_eq!(stats.dirty_val_bytes, 0);
        assert_eq!(f.tracker.items.load(Ordering::Relaxed), 0);
        assert_eq!(f.tracker.bytes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_dirty_seg_emits_sorted_keys() {
        let f = fixture();
        let lock = wlock(0, 99);

        for ino in [50u64, 3, 77, 12, 9, 31] {
            f.cache.create(&k(ino), val("v"), &lock).unwrap();
        }

        let mut seg = TestSegment::new();
        f.cache.dirty_seg(&mut seg).unwrap();
        let keys: Vec<Key> = seg.records.iter().map(|r| r.0).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 6);
    }

    #[test]
    fn test_dirty_seg_aborts_on_full_segment() {
        let f = fixture();
        let lock = wlock(0, 99);

        f.cache.create(&k(1), val("a"), &lock).unwrap();
        f.cache.create(&k(2), val("b"), &lock).unwrap();

        let mut seg = TestSegment::with_capacity(1);
        let err = f.cache.dirty_seg(&mut seg).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_dirty_fits_single_tracks_accounting() {
        let f = fixture();
        let lock = wlock(0, 99);

        assert!(f.cache.dirty_fits_single(0, 0));
        f.cache.create(&k(1), val("abc"), &lock).unwrap();
        assert!(f.cache.dirty_fits_single(10, 1000));
        assert!(!f.cache.dirty_fits_single(u64::MAX / 2, 0));
    }

    #[test]
    fn test_writeback_syncs_only_dirty_ranges() {
        let f = fixture();
        let lock = wlock(0, 9);
        f.cache.create(&k(1), val("A"), &lock).unwrap();

        assert_eq!(f.cache.writeback(&k(20), &k(30)).unwrap(), 0);
        assert_eq!(f.tracker.syncs.load(Ordering::Relaxed), 0);

        let count = f.cache.writeback(&k(0), &k(9)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(f.tracker.syncs.load(Ordering::Relaxed), 1);
        assert_eq!(f.cache.counters().commit_flush.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_invalidate_splits_coverage() {
        // scenario: invalidating the middle of a range drops the items
        // inside it and leaves two ranges around it
        let f = fixture();
        f.cache
            .insert_batch(batch((10, 20), &[(12, "L"), (14, "M"), (16, "R")]))
            .unwrap();

        let count = f.cache.invalidate(&k(13), &k(15)).unwrap();
        assert_eq!(count, 1);

        assert_eq!(
            f.cache.range_keys_since(&Key::zeros(), 8),
            vec![
                k(10),
                k(13).decremented(),
                k(15).incremented(),
                k(20),
            ]
        );
        let lock = rlock(10, 20);
        assert_eq!(f.cache.lookup(&k(12), &lock).unwrap(), val("L"));
        assert_eq!(f.cache.lookup(&k(16), &lock).unwrap(), val("R"));
        // 14 is no longer covered, looking it up goes to the manifest
        let reads_before = f.manifest.reads();
        let _ = f.cache.lookup(&k(14), &lock);
        assert!(f.manifest.reads() > reads_before);
    }

    #[test]
    fn test_shrink_splits_range_around_evicted_item() {
        // scenario: evicting the middle item of a covered run splits
        // the range, reusing the evicted slot for the right half
        let f = fixture();
        f.cache
            .insert_batch(batch((0, 20), &[(5, "a"), (7, "b"), (9, "c")]))
            .unwrap();

        // make 7 the coldest item
        let lock = rlock(0, 20);
        f.cache.lookup(&k(5), &lock).unwrap();
        f.cache.lookup(&k(9), &lock).unwrap();

        let freed = f.cache.shrink(1);
        assert_eq!(freed, 1);

        assert_eq!(
            f.cache.range_keys_since(&Key::zeros(), 8),
            vec![
                k(0),
                k(7).decremented(),
                k(7).incremented(),
                k(20),
            ]
        );
        assert_eq!(f.cache.counters().shrink_split_range.load(Ordering::Relaxed), 1);

        // the neighbors stayed resident and covered
        assert_eq!(f.cache.lookup(&k(5), &lock).unwrap(), val("a"));
        assert_eq!(f.cache.lookup(&k(9), &lock).unwrap(), val("c"));
        assert_eq!(f.manifest.reads(), 0);
        assert_eq!(f.cache.stats().resident_items, 2);
    }

    #[test]
    fn test_shrink_never_evicts_dirty_items() {
        let f = fixture();
        let lock = wlock(0, 20);
        f.cache
            .insert_batch(batch((0, 20), &[(5, "a"), (7, "b")]))
            .unwrap();
        f.cache.dirty(&k(5), &lock).unwrap();
        f.cache.dirty(&k(7), &lock).unwrap();

        assert_eq!(f.cache.shrink(16), 0);
        assert_eq!(f.cache.stats().resident_items, 2);
        assert!(f.cache.has_dirty());
    }

    #[test]
    fn test_shrink_erases_uncovered_items_directly() {
        let f = fixture();
        let only = ItemLock::write_only(k(0), k(9));

        f.cache.create_force(&k(5), val("x"), &only).unwrap();
        f.cache.dirty_seg(&mut TestSegment::new()).unwrap();

        assert_eq!(f.cache.shrink(8), 1);
        assert_eq!(f.cache.counters().shrink_outside.load(Ordering::Relaxed), 1);
        assert_eq!(f.cache.stats().resident_items, 0);
    }

    #[test]
    fn test_shrink_drops_empty_ranges_with_empty_tree() {
        let f = fixture();
        f.cache.insert_batch(batch((0, 9), &[(4, "x")])).unwrap();

        // the lone item's window is the whole range
        assert_eq!(f.cache.shrink(8), 1);
        let stats = f.cache.stats();
        assert_eq!(stats.resident_items, 0);
        assert_eq!(stats.cached_ranges, 0);
    }

    #[test]
    fn test_pool_exhaustion_surfaces_as_out_of_memory() {
        let f = fixture_with(CacheConfig::with_max_slots(3), Arc::default());
        let lock = wlock(0, 99);

        // range + two items fill the pool
        f.cache.insert_batch(batch((0, 99), &[])).unwrap();
        f.cache.create(&k(1), val("a"), &lock).unwrap();
        f.cache.create(&k(2), val("b"), &lock).unwrap();

        let err = f.cache.create(&k(3), val("c"), &lock).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
        // nothing was inserted for the failed create
        assert_eq!(f.cache.stats().resident_items, 2);
    }

    #[test]
    fn test_delete_force_writes_tombstone_blind() {
        let f = fixture();
        let only = ItemLock::write_only(k(0), k(9));

        f.cache.delete_force(&k(3), &only).unwrap();
        assert!(f.cache.has_dirty());

        let mut seg = TestSegment::new();
        f.cache.dirty_seg(&mut seg).unwrap();
        assert_eq!(seg.records.len(), 1);
        assert!(seg.records[0].2);
        assert_eq!(f.cache.stats().resident_items, 0);
    }

    #[test]
    fn test_delete_dirty_drops_fresh_item() {
        let f = fixture();
        let lock = wlock(0, 9);

        f.cache.create(&k(1), val("A"), &lock).unwrap();
        f.cache.delete_dirty(&k(1));
        assert!(!f.cache.has_dirty());
        assert!(matches!(
            f.cache.lookup(&k(1), &lock).unwrap_err(),
            Error::NotFound
        ));
    }

    #[test]
    fn test_update_dirty_shrinks_in_place() {
        let f = fixture();
        let lock = wlock(0, 9);

        f.cache.create(&k(1), val("abcd"), &lock).unwrap();
        f.cache.update_dirty(&k(1), val("ab")).unwrap();
        assert_eq!(f.cache.lookup(&k(1), &lock).unwrap(), val("ab"));
        assert_eq!(f.cache.stats().dirty_val_bytes, 2);

        let err = f.cache.update_dirty(&k(1), val("abcdef")).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_lookup_exact_checks_length() {
        let f = fixture();
        let lock = wlock(0, 9);

        f.cache.create(&k(1), val("AB"), &lock).unwrap();
        assert_eq!(f.cache.lookup_exact(&k(1), 2, &lock).unwrap(), val("AB"));
        let err = f.cache.lookup_exact(&k(1), 3, &lock).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_item_keys_since_skips_tombstones() {
        let f = fixture();
        let lock = wlock(0, 9);

        for ino in 1..=4 {
            f.cache.create(&k(ino), val("v"), &lock).unwrap();
        }
        f.cache.dirty_seg(&mut TestSegment::new()).unwrap();
        f.cache.delete(&k(2), &lock).unwrap();

        assert_eq!(
            f.cache.item_keys_since(&Key::zeros(), 10),
            vec![k(1), k(3), k(4)]
        );
        assert_eq!(f.cache.item_keys_since(&Key::zeros(), 2), vec![k(1), k(3)]);
    }

    #[test]
    fn test_background_shrink_thread() {
        let config = CacheConfig {
            max_slots: 1024,
            background_shrink: true,
            shrink_interval: Duration::from_millis(5),
            lru_high_watermark: 0,
            shrink_batch: 1024,
        };
        let f = fixture_with(config, Arc::default());

        let mut b = ReadBatch::new(k(0), k(99));
        for ino in 0..16 {
            b.push(k(ino), val("x")).unwrap();
        }
        f.cache.insert_batch(b).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while f.cache.stats().resident_items > 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "background shrink never drained the cache"
            );
            thread::sleep(Duration::from_millis(10));
        }
        drop(f.cache);
    }

    #[test]
    fn test_randomized_against_shadow_map() {
        let f = fixture();
        let lock = wlock(0, 999);
        let mut shadow: BTreeMap<u64, Option<Bytes>> = BTreeMap::new();
        let mut rng = SmallRng::seed_from_u64(0xfeed);

        for _ in 0..600 {
            let ino = rng.gen_range(0..60);
            match rng.gen_range(0..4) {
                0 => {
                    let v = val(&format!("v{ino}"));
                    match f.cache.create(&k(ino), v.clone(), &lock) {
                        Ok(()) => {
                            assert!(!shadow.contains_key(&ino));
                            shadow.insert(ino, v);
                        }
                        Err(Error::AlreadyExists) => {
                            assert!(shadow.contains_key(&ino));
                        }
                        Err(other) => panic!("create failed: {other}"),
                    }
                }
                1 => {
                    let v = val(&format!("u{ino}"));
                    match f.cache.update(&k(ino), v.clone(), &lock) {
                        Ok(()) => {
                            assert!(shadow.contains_key(&ino));
                            shadow.insert(ino, v);
                        }
                        Err(Error::NotFound) => assert!(!shadow.contains_key(&ino)),
                        Err(other) => panic!("update failed: {other}"),
                    }
                }
                2 => match f.cache.delete(&k(ino), &lock) {
                    Ok(()) => {
                        assert!(shadow.remove(&ino).is_some());
                    }
                    Err(Error::NotFound) => assert!(!shadow.contains_key(&ino)),
                    Err(other) => panic!("delete failed: {other}"),
                },
                _ => match f.cache.lookup(&k(ino), &lock) {
                    Ok(v) => assert_eq!(shadow.get(&ino), Some(&v)),
                    Err(Error::NotFound) => assert!(!shadow.contains_key(&ino)),
                    Err(other) => panic!("lookup failed: {other}"),
                },
            }
            // an occasional commit cycles persistence and tombstones
            if rng.gen_range(0..50) == 0 {
                f.cache.dirty_seg(&mut TestSegment::new()).unwrap();
            }
        }

        // full iteration matches the shadow map
        let mut got = Vec::new();
        let mut pos = Key::zeros();
        loop {
            match f.cache.next(&pos, &k(999), &lock) {
                Ok((key, v)) => {
                    got.push((key, v));
                    pos = key.incremented();
                }
                Err(Error::NotFound) => break,
                Err(other) => panic!("next failed: {other}"),
            }
        }
        let expect: Vec<(Key, Option<Bytes>)> =
            shadow.iter().map(|(ino, v)| (k(*ino), v.clone())).collect();
        assert_eq!(got, expect);

        let stats = f.cache.stats();
        assert_eq!(stats.nr_dirty_items, f.tracker.items.load(Ordering::Relaxed));
    }
}
