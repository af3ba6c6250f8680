//! Cached key ranges, the negative cache
//!
//! A range `[start, end]` asserts that every key inside it has a
//! definitive verdict: either an item is present in the item tree or
//! the key is known-absent. The ranges form a maximal cover, pairwise
//! disjoint and non-adjacent, ordered in their own tree by their
//! disjoint intervals.

use crate::counters::CacheCounters;
use crate::pool::{Link, Pool, SlotId};
use crate::tree::{self, Augment};
use siltfs_common::Key;
use std::cmp::Ordering;

/// Compare two closed intervals: Equal means they overlap.
pub(crate) fn cmp_ranges(a_start: &Key, a_end: &Key, b_start: &Key, b_end: &Key) -> Ordering {
    if a_end < b_start {
        Ordering::Less
    } else if a_start > b_end {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// Result of a point descent: the containing range if any, and the
/// nearest ranges on either side.
pub(crate) struct RangeWalk {
    pub found: Link,
    pub prev: Link,
    pub next: Link,
}

/// Walk the range tree once for a point query.
pub(crate) fn walk_ranges(pool: &Pool, root: Link, key: &Key) -> RangeWalk {
    let mut prev = None;
    let mut next = None;
    let mut link = root;

    while let Some(id) = link {
        let rng = pool.range(id);
        match cmp_ranges(key, key, &rng.start, &rng.end) {
            Ordering::Less => {
                next = Some(id);
                link = rng.links.left;
            }
            Ordering::Greater => {
                prev = Some(id);
                link = rng.links.right;
            }
            Ordering::Equal => {
                return RangeWalk {
                    found: Some(id),
                    prev,
                    next,
                };
            }
        }
    }

    RangeWalk {
        found: None,
        prev,
        next,
    }
}

/// Insert a new cached range, merging any overlapping or adjacent
/// siblings into it before restarting the descent. The caller's record
/// is freed if an existing range already covers it.
pub(crate) fn insert_range(pool: &mut Pool, root: &mut Link, counters: &CacheCounters, ins: SlotId) {
    CacheCounters::inc(&counters.range_insert);

    'restart: loop {
        let (ins_start, ins_end) = {
            let r = pool.range(ins);
            (r.start, r.end)
        };
        // probe one key beyond each endpoint so adjacent ranges merge
        // and the cover stays maximal
        let probe_start = if ins_start.is_zeros() {
            ins_start
        } else {
            ins_start.decremented()
        };
        let probe_end = if ins_end == Key::max_value() {
            ins_end
        } else {
            ins_end.incremented()
        };

        let mut parent = None;
        let mut right_child = false;
        let mut link = *root;
        while let Some(id) = link {
            let (rs, re) = {
                let r = pool.range(id);
                (r.start, r.end)
            };
            match cmp_ranges(&probe_start, &probe_end, &rs, &re) {
                Ordering::Less => {
                    parent = Some(id);
                    right_child = false;
                    link = pool.range(id).links.left;
                }
                Ordering::Greater => {
                    parent = Some(id);
                    right_child = true;
                    link = pool.range(id).links.right;
                }
                Ordering::Equal => {
                    // free our insertion if it sits entirely within an existing range
                    if ins_start >= rs && ins_end <= re {
                        pool.free(ins);
                        CacheCounters::inc(&counters.range_free);
                        return;
                    }

                    {
                        let r = pool.range_mut(ins);
                        if rs < r.start {
                            r.start = rs;
                        }
                        if re > r.end {
                            r.end = re;
                        }
                    }
                    tree::erase(pool, root, id, Augment::None);
                    pool.free(id);
                    CacheCounters::inc(&counters.range_free);
                    continue 'restart;
                }
            }
        }

        tree::link_node(pool, root, ins, parent, right_child, Augment::None);
        return;
    }
}

/// Remove the caller's range from the cover. Existing ranges are
/// trimmed so their endpoints name the last/first key that stays valid,
/// not the first/last key removed. If the removal falls strictly inside
/// an existing range, the caller's record becomes the right half and is
/// inserted; otherwise it is freed.
pub(crate) fn remove_range(pool: &mut Pool, root: &mut Link, counters: &CacheCounters, rem: SlotId) {
    let mut insert = false;

    'restart: loop {
        let mut parent = None;
        let mut right_child = false;
        let mut link = *root;
        while let Some(id) = link {
            let (rs, re) = {
                let r = pool.range(id);
                (r.start, r.end)
            };
            let (ms, me) = {
                let r = pool.range(rem);
                (r.start, r.end)
            };
            match cmp_ranges(&ms, &me, &rs, &re) {
                Ordering::Less => {
                    parent = Some(id);
                    right_child = false;
                    link = pool.range(id).links.left;
                }
                Ordering::Greater => {
                    parent = Some(id);
                    right_child = true;
                    link = pool.range(id).links.right;
                }
                Ordering::Equal => {
                    let start_cmp = ms.cmp(&rs);
                    let end_cmp = me.cmp(&re);

                    // removal strictly inside: keep the left half in
                    // place, our record becomes the right half
                    if start_cmp == Ordering::Greater && end_cmp == Ordering::Less {
                        pool.range_mut(id).end = ms.decremented();
                        {
                            let r = pool.range_mut(rem);
                            r.start = me.incremented();
                            r.end = re;
                        }
                        insert = true;
                        continue 'restart;
                    }

                    // removal covers the start of the existing range
                    if start_cmp == Ordering::Less && end_cmp == Ordering::Less {
                        pool.range_mut(id).start = me.incremented();
                        // nothing left of the trimmed range can overlap
                        // past its old start
                        pool.range_mut(rem).end = rs;
                        continue;
                    }

                    // removal covers the end of the existing range
                    if start_cmp == Ordering::Greater && end_cmp == Ordering::Greater {
                        pool.range_mut(id).end = ms.decremented();
                        pool.range_mut(rem).start = re;
                        continue;
                    }

                    // existing range surrounded by the removal
                    tree::erase(pool, root, id, Augment::None);
                    pool.free(id);
                    CacheCounters::inc(&counters.range_free);
                    continue 'restart;
                }
            }
        }

        if insert {
            tree::link_node(pool, root, rem, parent, right_child, Augment::None);
        } else {
            pool.free(rem);
            CacheCounters::inc(&counters.range_free);
        }
        return;
    }
}

/// Endpoints of the sorted ranges from the first range intersecting or
/// following `key`, at most `nr` keys (always an even count).
pub(crate) fn keys_since(pool: &Pool, root: Link, key: &Key, nr: usize) -> Vec<Key> {
    let walk = walk_ranges(pool, root, key);
    let mut out = Vec::with_capacity(nr.min(64));
    let mut link = walk.found.or(walk.next);

    while let Some(id) = link {
        if out.len() + 2 > nr {
            break;
        }
        let rng = pool.range(id);
        out.push(rng.start);
        out.push(rng.end);
        link = tree::next_in_order(pool, id);
    }
    out
}
