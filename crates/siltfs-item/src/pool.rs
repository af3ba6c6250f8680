//! Slot pool backing the item and range trees
//!
//! Items and cached ranges live in one slab of tagged slots. A slot is
//! big enough to hold either record, and freed slots are handed back out
//! most-recently-freed first. Both properties matter to the shrinker: it
//! runs under memory pressure and must be able to turn the slot of an
//! item it just evicted into the record for a split range without going
//! to the allocator.

use bytes::Bytes;
use siltfs_common::{Error, Key, Result};

/// Handle of a slot in the pool. Stable across tree rotations; only
/// freeing a slot invalidates its handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SlotId(u32);

/// An optional slot handle, the pool's equivalent of a null pointer.
pub(crate) type Link = Option<SlotId>;

/// Tree linkage embedded in every live slot
#[derive(Clone, Copy, Debug)]
pub(crate) struct TreeLinks {
    pub parent: Link,
    pub left: Link,
    pub right: Link,
    /// Treap heap priority, fixed at allocation
    pub prio: u64,
}

impl TreeLinks {
    pub fn new(prio: u64) -> Self {
        Self {
            parent: None,
            left: None,
            right: None,
            prio,
        }
    }
}

/// One cached item
#[derive(Debug)]
pub(crate) struct ItemNode {
    pub links: TreeLinks,
    pub key: Key,
    pub val: Option<Bytes>,
    /// Tombstone for a persistent key, scheduled to be flushed
    pub deletion: bool,
    /// The key exists (or existed) in segments
    pub persistent: bool,
    /// SELF/LEFT/RIGHT dirty bits, see the tree module
    pub dirty: u8,
    pub in_lru: bool,
    pub lru_prev: Link,
    pub lru_next: Link,
}

impl ItemNode {
    pub fn new(key: Key, val: Option<Bytes>, prio: u64) -> Self {
        Self {
            links: TreeLinks::new(prio),
            key,
            val,
            deletion: false,
            persistent: false,
            dirty: 0,
            in_lru: false,
            lru_prev: None,
            lru_next: None,
        }
    }

    pub fn val_len(&self) -> usize {
        self.val.as_ref().map_or(0, Bytes::len)
    }
}

/// One cached range: every key in `[start, end]` has a definitive
/// verdict in the item tree.
#[derive(Debug)]
pub(crate) struct RangeNode {
    pub links: TreeLinks,
    pub start: Key,
    pub end: Key,
}

impl RangeNode {
    pub fn new(start: Key, end: Key, prio: u64) -> Self {
        Self {
            links: TreeLinks::new(prio),
            start,
            end,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Slot {
    Free { next: Link },
    Item(ItemNode),
    Range(RangeNode),
}

// The shrinker reuses an evicted item's slot as a range record.
const _: () = assert!(std::mem::size_of::<ItemNode>() >= std::mem::size_of::<RangeNode>());

/// Bounded slab of item/range slots with an intrusive free list
pub(crate) struct Pool {
    slots: Vec<Slot>,
    free: Link,
    free_len: usize,
    max_slots: usize,
    nr_items: usize,
    nr_ranges: usize,
}

impl Pool {
    pub fn new(max_slots: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: None,
            free_len: 0,
            max_slots,
            nr_items: 0,
            nr_ranges: 0,
        }
    }

    /// Slots that can still be handed out without exceeding the budget
    pub fn available(&self) -> usize {
        self.free_len + (self.max_slots - self.slots.len())
    }

    pub fn nr_items(&self) -> usize {
        self.nr_items
    }

    pub fn nr_ranges(&self) -> usize {
        self.nr_ranges
    }

    fn count_alloc(&mut self, slot: &Slot) {
        match slot {
            Slot::Item(_) => self.nr_items += 1,
            Slot::Range(_) => self.nr_ranges += 1,
            Slot::Free { .. } => {}
        }
    }

    /// Allocate a slot, reusing the most recently freed one first.
    pub fn alloc(&mut self, slot: Slot) -> Result<SlotId> {
        if let Some(id) = self.free {
            let next = match &self.slots[id.0 as usize] {
                Slot::Free { next } => *next,
                _ => panic!("pool free list points at a live slot"),
            };
            self.free = next;
            self.free_len -= 1;
            self.count_alloc(&slot);
            self.slots[id.0 as usize] = slot;
            return Ok(id);
        }

        if self.slots.len() >= self.max_slots {
            return Err(Error::out_of_memory("item cache slot pool exhausted"));
        }

        let id = SlotId(self.slots.len() as u32);
        self.count_alloc(&slot);
        self.slots.push(slot);
        Ok(id)
    }

    /// Free a slot, pushing it onto the head of the free list.
    pub fn free(&mut self, id: SlotId) {
        let old = std::mem::replace(&mut self.slots[id.0 as usize], Slot::Free { next: self.free });
        match old {
            Slot::Item(_) => self.nr_items -= 1,
            Slot::Range(_) => self.nr_ranges -= 1,
            Slot::Free { .. } => panic!("double free of pool slot"),
        }
        self.free = Some(id);
        self.free_len += 1;
    }

    /// Free an item slot and hand its contents back to the caller.
    pub fn free_item(&mut self, id: SlotId) -> ItemNode {
        let old = std::mem::replace(&mut self.slots[id.0 as usize], Slot::Free { next: self.free });
        let node = match old {
            Slot::Item(node) => node,
            _ => panic!("free_item on a non-item slot"),
        };
        self.nr_items -= 1;
        self.free = Some(id);
        self.free_len += 1;
        node
    }

    pub fn item(&self, id: SlotId) -> &ItemNode {
        match &self.slots[id.0 as usize] {
            Slot::Item(node) => node,
            _ => panic!("slot is not an item"),
        }
    }

    pub fn item_mut(&mut self, id: SlotId) -> &mut ItemNode {
        match &mut self.slots[id.0 as usize] {
            Slot::Item(node) => node,
            _ => panic!("slot is not an item"),
        }
    }

    pub fn range(&self, id: SlotId) -> &RangeNode {
        match &self.slots[id.0 as usize] {
            Slot::Range(node) => node,
            _ => panic!("slot is not a range"),
        }
    }

    pub fn range_mut(&mut self, id: SlotId) -> &mut RangeNode {
        match &mut self.slots[id.0 as usize] {
            Slot::Range(node) => node,
            _ => panic!("slot is not a range"),
        }
    }

    /// Tree linkage of a live slot, item or range.
    pub fn links(&self, id: SlotId) -> &TreeLinks {
        match &self.slots[id.0 as usize] {
            Slot::Item(node) => &node.links,
            Slot::Range(node) => &node.links,
            Slot::Free { .. } => panic!("links of a free slot"),
        }
    }

    pub fn links_mut(&mut self, id: SlotId) -> &mut TreeLinks {
        match &mut self.slots[id.0 as usize] {
            Slot::Item(node) => &mut node.links,
            Slot::Range(node) => &mut node.links,
            Slot::Free { .. } => panic!("links of a free slot"),
        }
    }
}
