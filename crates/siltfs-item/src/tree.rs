//! Parent-linked ordered index with a dirty-subtree augmentation
//!
//! Both the item tree and the range tree are treaps over pool slots:
//! binary search trees ordered by key with randomized heap priorities.
//! Every structural change goes through a rotation or a splice, which is
//! where the item tree's augmentation is maintained.
//!
//! The augmentation gives each item three bits: SELF marks the item
//! itself dirty, LEFT and RIGHT summarize whether the respective subtree
//! holds any SELF-dirty item. The aggregate is not a symmetric OR of the
//! children, it distinguishes left from right, so after a rotation both
//! pivots are recomputed from their current children and the change is
//! propagated upward until the bits stop changing. `first_dirty` and
//! `next_dirty` then traverse only dirty subtrees, yielding the dirty
//! items in ascending key order without visiting clean ones.

use crate::pool::{Link, Pool, SlotId};
use siltfs_common::Key;

/// The item itself must be written at the next commit
pub(crate) const DIRTY_SELF: u8 = 0x1;
/// The left subtree contains a SELF-dirty item
pub(crate) const DIRTY_LEFT: u8 = 0x2;
/// The right subtree contains a SELF-dirty item
pub(crate) const DIRTY_RIGHT: u8 = 0x4;

/// Whether a tree maintains the dirty augmentation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Augment {
    Dirty,
    None,
}

fn link_any_dirty(pool: &Pool, link: Link) -> bool {
    link.is_some_and(|id| pool.item(id).dirty != 0)
}

/// Recompute an item's dirty bits from its own SELF bit and its current
/// children.
pub(crate) fn compute_dirty(pool: &Pool, id: SlotId) -> u8 {
    let it = pool.item(id);
    let mut dirty = it.dirty & DIRTY_SELF;
    if link_any_dirty(pool, it.links.left) {
        dirty |= DIRTY_LEFT;
    }
    if link_any_dirty(pool, it.links.right) {
        dirty |= DIRTY_RIGHT;
    }
    dirty
}

fn recompute_dirty(pool: &mut Pool, id: SlotId) {
    let dirty = compute_dirty(pool, id);
    pool.item_mut(id).dirty = dirty;
}

/// Walk up from `link` refreshing aggregates until a node's bits come
/// out unchanged.
pub(crate) fn propagate_dirty(pool: &mut Pool, mut link: Link) {
    while let Some(id) = link {
        let dirty = compute_dirty(pool, id);
        if pool.item(id).dirty == dirty {
            break;
        }
        pool.item_mut(id).dirty = dirty;
        link = pool.links(id).parent;
    }
}

/// Rotate `id` up over its parent. The old pivot is recomputed first
/// since the new pivot's aggregate depends on it.
fn rotate_up_once(pool: &mut Pool, root: &mut Link, id: SlotId, aug: Augment) {
    let Some(p) = pool.links(id).parent else {
        return;
    };
    let g = pool.links(p).parent;

    if pool.links(p).left == Some(id) {
        let moved = pool.links(id).right;
        pool.links_mut(p).left = moved;
        if let Some(m) = moved {
            pool.links_mut(m).parent = Some(p);
        }
        pool.links_mut(id).right = Some(p);
    } else {
        let moved = pool.links(id).left;
        pool.links_mut(p).right = moved;
        if let Some(m) = moved {
            pool.links_mut(m).parent = Some(p);
        }
        pool.links_mut(id).left = Some(p);
    }
    pool.links_mut(p).parent = Some(id);
    pool.links_mut(id).parent = g;

    match g {
        None => *root = Some(id),
        Some(g) => {
            if pool.links(g).left == Some(p) {
                pool.links_mut(g).left = Some(id);
            } else {
                pool.links_mut(g).right = Some(id);
            }
        }
    }

    if aug == Augment::Dirty {
        recompute_dirty(pool, p);
        recompute_dirty(pool, id);
    }
}

/// Attach `id` as a leaf at the descent position the caller found, then
/// rotate it up until the heap property holds again.
pub(crate) fn link_node(
    pool: &mut Pool,
    root: &mut Link,
    id: SlotId,
    parent: Link,
    right_child: bool,
    aug: Augment,
) {
    {
        let links = pool.links_mut(id);
        links.parent = parent;
        links.left = None;
        links.right = None;
    }
    match parent {
        None => *root = Some(id),
        Some(p) => {
            if right_child {
                pool.links_mut(p).right = Some(id);
            } else {
                pool.links_mut(p).left = Some(id);
            }
        }
    }

    while let Some(p) = pool.links(id).parent {
        if pool.links(id).prio > pool.links(p).prio {
            rotate_up_once(pool, root, id, aug);
        } else {
            break;
        }
    }
}

/// Remove `id` from the tree. The slot itself stays allocated; the
/// caller decides whether to free or reuse it.
pub(crate) fn erase(pool: &mut Pool, root: &mut Link, id: SlotId, aug: Augment) {
    // rotate toward a leaf, promoting the higher-priority child so the
    // heap property survives
    loop {
        let (left, right) = {
            let links = pool.links(id);
            (links.left, links.right)
        };
        let child = match (left, right) {
            (Some(lc), Some(rc)) => {
                if pool.links(lc).prio > pool.links(rc).prio {
                    lc
                } else {
                    rc
                }
            }
            _ => break,
        };
        rotate_up_once(pool, root, child, aug);
    }

    let (child, parent) = {
        let links = pool.links(id);
        (links.left.or(links.right), links.parent)
    };
    if let Some(c) = child {
        pool.links_mut(c).parent = parent;
    }
    match parent {
        None => *root = child,
        Some(p) => {
            if pool.links(p).left == Some(id) {
                pool.links_mut(p).left = child;
            } else {
                pool.links_mut(p).right = child;
            }
        }
    }
    {
        let links = pool.links_mut(id);
        links.parent = None;
        links.left = None;
        links.right = None;
    }

    if aug == Augment::Dirty {
        propagate_dirty(pool, parent);
    }
}

pub(crate) fn leftmost(pool: &Pool, mut id: SlotId) -> SlotId {
    while let Some(l) = pool.links(id).left {
        id = l;
    }
    id
}

pub(crate) fn rightmost(pool: &Pool, mut id: SlotId) -> SlotId {
    while let Some(r) = pool.links(id).right {
        id = r;
    }
    id
}

/// Smallest node of the tree
pub(crate) fn first(pool: &Pool, root: Link) -> Link {
    root.map(|r| leftmost(pool, r))
}

/// In-order successor via parent links
pub(crate) fn next_in_order(pool: &Pool, id: SlotId) -> Link {
    if let Some(r) = pool.links(id).right {
        return Some(leftmost(pool, r));
    }
    let mut node = id;
    while let Some(p) = pool.links(node).parent {
        if pool.links(p).right == Some(node) {
            node = p;
        } else {
            return Some(p);
        }
    }
    None
}

/// In-order predecessor via parent links
pub(crate) fn prev_in_order(pool: &Pool, id: SlotId) -> Link {
    if let Some(l) = pool.links(id).left {
        return Some(rightmost(pool, l));
    }
    let mut node = id;
    while let Some(p) = pool.links(node).parent {
        if pool.links(p).left == Some(node) {
            node = p;
        } else {
            return Some(p);
        }
    }
    None
}

/// Smallest-key SELF-dirty item in the subtree under `link`
pub(crate) fn first_dirty(pool: &Pool, mut link: Link) -> Link {
    let mut ret = None;
    while let Some(id) = link {
        let it = pool.item(id);
        if it.dirty & DIRTY_LEFT != 0 {
            link = it.links.left;
        } else if it.dirty & DIRTY_SELF != 0 {
            ret = Some(id);
            break;
        } else if it.dirty & DIRTY_RIGHT != 0 {
            link = it.links.right;
        } else {
            break;
        }
    }
    ret
}

/// Next SELF-dirty item after `id` in key order. Checks the right
/// subtree first, then climbs to the next greater ancestor and either
/// returns it or keeps searching from its right subtree.
pub(crate) fn next_dirty(pool: &Pool, mut id: SlotId) -> Link {
    loop {
        if pool.item(id).dirty & DIRTY_RIGHT != 0 {
            return first_dirty(pool, pool.links(id).right);
        }

        let mut node = id;
        let parent = loop {
            match pool.links(node).parent {
                Some(p) if pool.links(p).right == Some(node) => node = p,
                other => break other,
            }
        };
        let Some(p) = parent else {
            return None;
        };

        if pool.item(p).dirty & DIRTY_SELF != 0 {
            return Some(p);
        }
        id = p;
    }
}

/// Result of a single descent for a key: the exact item if present and
/// its in-order neighbors.
pub(crate) struct ItemWalk {
    pub found: Link,
    pub prev: Link,
    pub next: Link,
}

/// Walk the item tree once, returning the item at `key` along with the
/// nearest items on either side.
pub(crate) fn walk_items(pool: &Pool, root: Link, key: &Key) -> ItemWalk {
    let mut prev = None;
    let mut next = None;
    let mut link = root;

    while let Some(id) = link {
        let it = pool.item(id);
        match key.cmp(&it.key) {
            std::cmp::Ordering::Less => {
                next = Some(id);
                link = it.links.left;
            }
            std::cmp::Ordering::Greater => {
                prev = Some(id);
                link = it.links.right;
            }
            std::cmp::Ordering::Equal => {
                return ItemWalk {
                    found: Some(id),
                    prev,
                    next,
                };
            }
        }
    }

    ItemWalk {
        found: None,
        prev,
        next,
    }
}

/// Check structural and augmentation invariants of an item tree.
#[cfg(test)]
pub(crate) fn validate_items(pool: &Pool, root: Link) {
    fn rec(pool: &Pool, link: Link, parent: Link, min: Option<Key>, max: Option<Key>) {
        let Some(id) = link else {
            return;
        };
        let it = pool.item(id);
        assert_eq!(it.links.parent, parent, "parent link of {}", it.key);
        if let Some(p) = parent {
            assert!(
                pool.links(p).prio >= it.links.prio,
                "heap violation at {}",
                it.key
            );
        }
        if let Some(min) = min {
            assert!(it.key > min, "order violation at {}", it.key);
        }
        if let Some(max) = max {
            assert!(it.key < max, "order violation at {}", it.key);
        }
        assert_eq!(
            it.dirty,
            compute_dirty(pool, id),
            "stale dirty bits at {}",
            it.key
        );
        rec(pool, it.links.left, Some(id), min, Some(it.key));
        rec(pool, it.links.right, Some(id), Some(it.key), max);
    }
    rec(pool, root, None, None, None);
}
