//! Cache shrinking under memory pressure
//!
//! Freeing an item that a range still covers would turn it into a
//! phantom negative lookup, so the shrinker has to trim or split the
//! coverage around everything it evicts. It scans the LRU oldest-first,
//! walks outward from each victim to find a window whose edges make
//! numerically sound new range endpoints, then erases the window and
//! reshapes the range. Runs under the cache lock without allocating;
//! the record for a split range reuses the slot of an evicted item.

use crate::cache::CacheInner;
use crate::counters::CacheCounters;
use crate::pool::{Link, SlotId};
use crate::range;
use crate::trans::TransTracker;
use crate::tree::{self, Augment, DIRTY_SELF};
use siltfs_common::Key;
use tracing::error;

/// Keep walking this many steps past the first sound split point
pub(crate) const BOUNDARY_MIN: usize = 32;
/// Give up a boundary walk after this many steps
pub(crate) const BOUNDARY_MAX: usize = 300;

/// Walk from `item` toward `bound` (a range endpoint), recording the
/// furthest item whose key can be stepped past its neighbor to form a
/// new range endpoint. Stops at the range endpoint, at a dirty
/// neighbor, or once enough steps have passed with a point recorded.
/// Returns the recorded boundary and the neighbor that stays resident
/// beyond it, if any.
fn shrink_boundary(
    inner: &CacheInner,
    counters: &CacheCounters,
    item: SlotId,
    bound: &Key,
    toward_end: bool,
) -> (Link, Link) {
    let mut item = item;
    let mut found: Link = None;
    let mut neighbor: Link = None;

    for i in 0..BOUNDARY_MAX {
        let next = if toward_end {
            tree::next_in_order(&inner.pool, item)
        } else {
            tree::prev_in_order(&inner.pool, item)
        };

        let within = next.is_some_and(|n| {
            let nk = inner.pool.item(n).key;
            if toward_end {
                nk <= *bound
            } else {
                nk >= *bound
            }
        });
        let Some(n) = next.filter(|_| within) else {
            // the walk reached the end of the range; keep the nearest
            // recorded split point, or claim the whole side if none
            CacheCounters::inc(&counters.shrink_range_end);
            if found.is_none() {
                found = Some(item);
                neighbor = None;
            }
            break;
        };

        let sound = {
            let ik = inner.pool.item(item).key;
            let nk = inner.pool.item(n).key;
            if toward_end {
                ik.incremented() <= nk
            } else {
                ik.decremented() >= nk
            }
        };
        if sound {
            found = Some(item);
            neighbor = Some(n);
            if i >= BOUNDARY_MIN {
                break;
            }
        }

        if inner.pool.item(n).dirty & DIRTY_SELF != 0 {
            CacheCounters::inc(&counters.shrink_next_dirty);
            break;
        }

        item = n;
    }

    (found, neighbor)
}

/// Evict the window of items around one LRU victim inside the range
/// that covers it, reshaping the range so nothing evicted stays
/// covered. Returns the number of items freed, zero if no usable
/// window was found.
fn shrink_around(
    inner: &mut CacheInner,
    counters: &CacheCounters,
    tracker: &dyn TransTracker,
    rng_id: SlotId,
    item: SlotId,
) -> usize {
    let (rng_start, rng_end) = {
        let rng = inner.pool.range(rng_id);
        (rng.start, rng.end)
    };

    let (first, prev) = shrink_boundary(inner, counters, item, &rng_start, false);
    let (last, next) = shrink_boundary(inner, counters, item, &rng_end, true);
    let (Some(first), Some(last)) = (first, last) else {
        CacheCounters::inc(&counters.shrink_alone);
        return 0;
    };

    let first_key = inner.pool.item(first).key;
    let last_key = inner.pool.item(last).key;
    let mut nr = 0;

    // a retained left neighbor keeps the head of the range
    if prev.is_some() {
        inner.pool.range_mut(rng_id).end = first_key.decremented();
    }
    // only a right neighbor: the surviving range starts past the window
    if next.is_some() && prev.is_none() {
        inner.pool.range_mut(rng_id).start = last_key.incremented();
    }

    let mut erase_from = Some(first);
    let mut erase_until = last_key;

    // neighbors on both sides: the range splits, and the rightmost
    // window item donates its slot to the new right-half record
    if next.is_some() && prev.is_some() {
        let consumed = last;
        let before = tree::prev_in_order(&inner.pool, consumed);

        tree::erase(&mut inner.pool, &mut inner.items, consumed, Augment::Dirty);
        inner.lru.unlink(&mut inner.pool, consumed);
        inner.pool.free_item(consumed);
        CacheCounters::inc(&counters.item_free);
        nr += 1;

        let new_rng = match inner.alloc_range(last_key.incremented(), rng_end) {
            Ok(id) => id,
            Err(err) => {
                // cannot happen, a slot was freed just above
                error!(%err, "shrink split lost its reserved slot");
                return nr;
            }
        };
        range::insert_range(&mut inner.pool, &mut inner.ranges, counters, new_rng);
        CacheCounters::inc(&counters.shrink_split_range);

        if consumed == first {
            erase_from = None;
        } else {
            // `before` exists whenever the window holds more than one item
            erase_until = match before {
                Some(b) => inner.pool.item(b).key,
                None => first_key,
            };
        }
    }

    // the window was the whole range, drop the range itself
    if prev.is_none() && next.is_none() {
        tree::erase(&mut inner.pool, &mut inner.ranges, rng_id, Augment::None);
        inner.pool.free(rng_id);
        CacheCounters::inc(&counters.range_free);
    }

    if let Some(mut cur) = erase_from {
        loop {
            let next_item = tree::next_in_order(&inner.pool, cur);
            let is_last = inner.pool.item(cur).key >= erase_until;
            CacheCounters::inc(&counters.shrink);
            inner.erase_item(counters, tracker, cur);
            nr += 1;
            if is_last {
                break;
            }
            match next_item {
                Some(n) => cur = n,
                None => break,
            }
        }
    }

    nr
}

/// Scan the LRU oldest-first, evicting around each victim, until the
/// scan target is met or the list is exhausted. Items that cannot be
/// evicted rotate to the tail; meeting the first rotated item again
/// ends the scan. Returns the number of items freed.
pub(crate) fn shrink_scan(
    inner: &mut CacheInner,
    counters: &CacheCounters,
    tracker: &dyn TransTracker,
    nr_to_scan: usize,
) -> usize {
    let mut nr = nr_to_scan;
    let mut freed = 0;
    let mut first_moved: Link = None;

    while nr > 0 {
        let Some(item) = inner.lru.head() else {
            break;
        };
        // dirty items are never on the LRU
        debug_assert_eq!(inner.pool.item(item).dirty & DIRTY_SELF, 0);

        let key = inner.pool.item(item).key;
        let walk = range::walk_ranges(&inner.pool, inner.ranges, &key);
        let Some(rng_id) = walk.found else {
            // not covered by any range, nothing to preserve
            CacheCounters::inc(&counters.shrink_outside);
            inner.erase_item(counters, tracker, item);
            nr -= 1;
            freed += 1;
            continue;
        };

        let got = shrink_around(inner, counters, tracker, rng_id, item);
        if got == 0 {
            if first_moved == Some(item) {
                break;
            }
            if first_moved.is_none() {
                first_moved = Some(item);
            }
            inner.lru.touch(&mut inner.pool, item);
            continue;
        }

        freed += got;
        nr -= nr.min(got);
    }

    // with no items left there is nothing for the ranges to describe
    while inner.items.is_none() {
        let Some(rng) = tree::first(&inner.pool, inner.ranges) else {
            break;
        };
        tree::erase(&mut inner.pool, &mut inner.ranges, rng, Augment::None);
        inner.pool.free(rng);
        CacheCounters::inc(&counters.shrink_empty_range);
    }

    freed
}
