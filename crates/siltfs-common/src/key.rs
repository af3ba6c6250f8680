//! Item keys
//!
//! Every logical filesystem item is addressed by a fixed-structure key.
//! Keys sort by (zone, ino, kind, off) and are cheap to copy. The cache
//! and the segment layer treat them as opaque totally-ordered values;
//! the only arithmetic they need is the exact successor and predecessor
//! in that total order.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Inode index zone: per-field indexes used by scans and queries
pub const ZONE_INODE_INDEX: u8 = 1;
/// Filesystem zone: inodes, dirents, xattrs, extents
pub const ZONE_FS: u8 = 2;

/// Key kind within the filesystem zone
pub const KIND_INODE: u8 = 1;
/// Extended attribute kind
pub const KIND_XATTR: u8 = 2;
/// Directory entry kind
pub const KIND_DIRENT: u8 = 3;

/// Fixed-structure key for one logical item
///
/// Field declaration order is the sort order.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize,
    Deserialize,
)]
#[display("{zone}.{ino}.{kind}.{off}")]
pub struct Key {
    pub zone: u8,
    pub ino: u64,
    pub kind: u8,
    pub off: u64,
}

impl Key {
    /// Create a key from raw fields
    pub fn new(zone: u8, ino: u64, kind: u8, off: u64) -> Self {
        Self {
            zone,
            ino,
            kind,
            off,
        }
    }

    /// The smallest possible key
    pub fn zeros() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// The largest possible key
    pub fn max_value() -> Self {
        Self::new(u8::MAX, u64::MAX, u8::MAX, u64::MAX)
    }

    /// Key of an inode item
    pub fn inode(ino: u64) -> Self {
        Self::new(ZONE_FS, ino, KIND_INODE, 0)
    }

    /// Key of a directory entry, positioned by name hash
    pub fn dirent(dir_ino: u64, hash: u64) -> Self {
        Self::new(ZONE_FS, dir_ino, KIND_DIRENT, hash)
    }

    /// Key of an extended attribute, positioned by xattr id
    pub fn xattr(ino: u64, id: u64) -> Self {
        Self::new(ZONE_FS, ino, KIND_XATTR, id)
    }

    /// Reset the key to the smallest value
    pub fn set_zero(&mut self) {
        *self = Self::zeros();
    }

    /// True if every field is zero
    pub fn is_zeros(&self) -> bool {
        *self == Self::zeros()
    }

    /// Advance to the exact successor in the total order, wrapping at the
    /// largest key.
    pub fn inc(&mut self) {
        let (off, carry) = self.off.overflowing_add(1);
        self.off = off;
        if !carry {
            return;
        }
        let (kind, carry) = self.kind.overflowing_add(1);
        self.kind = kind;
        if !carry {
            return;
        }
        let (ino, carry) = self.ino.overflowing_add(1);
        self.ino = ino;
        if !carry {
            return;
        }
        self.zone = self.zone.wrapping_add(1);
    }

    /// Step back to the exact predecessor, wrapping at the smallest key.
    pub fn dec(&mut self) {
        let (off, borrow) = self.off.overflowing_sub(1);
        self.off = off;
        if !borrow {
            return;
        }
        let (kind, borrow) = self.kind.overflowing_sub(1);
        self.kind = kind;
        if !borrow {
            return;
        }
        let (ino, borrow) = self.ino.overflowing_sub(1);
        self.ino = ino;
        if !borrow {
            return;
        }
        self.zone = self.zone.wrapping_sub(1);
    }

    /// The successor as a new key
    pub fn incremented(mut self) -> Self {
        self.inc();
        self
    }

    /// The predecessor as a new key
    pub fn decremented(mut self) -> Self {
        self.dec();
        self
    }
}
