//! Intrusive LRU of clean items
//!
//! Clean resident items are linked through their pool slots, oldest at
//! the head. Dirty items are pinned by the transaction and stay off the
//! list; marking an item dirty unlinks it and clearing dirty relinks it
//! at the tail.

use crate::pool::{Link, Pool, SlotId};

#[derive(Debug, Default)]
pub(crate) struct Lru {
    head: Link,
    tail: Link,
    len: usize,
}

impl Lru {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Oldest linked item
    pub fn head(&self) -> Link {
        self.head
    }

    /// Link an item at the most-recently-used end.
    pub fn push_tail(&mut self, pool: &mut Pool, id: SlotId) {
        let tail = self.tail;
        {
            let it = pool.item_mut(id);
            debug_assert!(!it.in_lru);
            it.in_lru = true;
            it.lru_prev = tail;
            it.lru_next = None;
        }
        match tail {
            Some(t) => pool.item_mut(t).lru_next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Unlink an item if it is on the list.
    pub fn unlink(&mut self, pool: &mut Pool, id: SlotId) {
        let (prev, next) = {
            let it = pool.item_mut(id);
            if !it.in_lru {
                return;
            }
            it.in_lru = false;
            let pair = (it.lru_prev, it.lru_next);
            it.lru_prev = None;
            it.lru_next = None;
            pair
        };
        match prev {
            Some(p) => pool.item_mut(p).lru_next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => pool.item_mut(n).lru_prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Move a referenced item to the most-recently-used end.
    pub fn touch(&mut self, pool: &mut Pool, id: SlotId) {
        if pool.item(id).in_lru {
            self.unlink(pool, id);
            self.push_tail(pool, id);
        }
    }
}
