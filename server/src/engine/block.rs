/*
 * Created on Fri Jan 12 2024
 *
 * This file is a part of SkyFS
 * SkyFS is a free and open-source transactional filesystem storage engine
 * written by Sayan Nandan ("the Author") with the vision to keep every byte
 * of user data and metadata in a single balanced tree without compromising
 * on durability, concurrency or performance.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! 64-bit block addresses. The high bit splits the space into *real*
//! (disk-resident) and *fake* (in-memory only) ranges; within the fake range
//! a second tag separates yet-unallocated tree content from bitmap shadow
//! blocks. On-disk pointers must always be real

use {
    super::error::{Error, RuntimeResult},
    core::fmt,
};

/// Number of blocks
pub type BlockCount = u64;

const FAKE_BIT: u64 = 1 << 63;
const BITMAP_TAG: u64 = 1 << 62;
/// the high nibble is reserved for fake-block discrimination: on-disk
/// pointers must have it clear
const DISK_RESERVED_MASK: u64 = 0xf << 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockNr(u64);

/// The in-memory parent address of the real tree root (the "uber" node)
pub const FAKE_TREE_ADDR: BlockNr = BlockNr(u64::MAX);

impl BlockNr {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
    /// A real, disk-resident block address. Fails on any address with the
    /// reserved nibble set
    pub const fn real(raw: u64) -> Option<Self> {
        if raw & DISK_RESERVED_MASK != 0 {
            None
        } else {
            Some(Self(raw))
        }
    }
    /// A fake address carrying unallocated tree content
    pub const fn fake_unallocated(seq: u64) -> Self {
        Self(FAKE_BIT | (seq & !(FAKE_BIT | BITMAP_TAG)))
    }
    /// A fake address shadowing the working bitmap block at `index`
    pub const fn fake_bitmap(index: u64) -> Self {
        Self(FAKE_BIT | BITMAP_TAG | (index & !(FAKE_BIT | BITMAP_TAG)))
    }
    pub const fn raw(self) -> u64 {
        self.0
    }
    pub const fn is_fake(self) -> bool {
        self.0 & FAKE_BIT != 0
    }
    pub const fn is_bitmap_shadow(self) -> bool {
        self.is_fake() && self.0 & BITMAP_TAG != 0
    }
    /// The bitmap block index shadowed by this fake address
    pub const fn bitmap_index(self) -> u64 {
        self.0 & !(FAKE_BIT | BITMAP_TAG)
    }
    pub const fn is_fake_tree_addr(self) -> bool {
        self.0 == FAKE_TREE_ADDR.0
    }
    /// Encode for disk. Fake addresses never hit the disk
    pub fn encode(self) -> RuntimeResult<[u8; 8]> {
        if self.is_fake() {
            return Err(Error::Corrupt);
        }
        Ok(self.0.to_le_bytes())
    }
    /// Decode a disk pointer, rejecting addresses in the reserved range
    pub fn decode(buf: [u8; 8]) -> RuntimeResult<Self> {
        let raw = u64::from_le_bytes(buf);
        BlockNr::real(raw).ok_or(Error::Corrupt)
    }
    pub const fn step(self, by: u64) -> Self {
        Self(self.0 + by)
    }
}

impl fmt::Display for BlockNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_fake_tree_addr() {
            write!(f, "<uber>")
        } else if self.is_bitmap_shadow() {
            write!(f, "<bmap {}>", self.bitmap_index())
        } else if self.is_fake() {
            write!(f, "<fake {}>", self.0 & !(FAKE_BIT | BITMAP_TAG))
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_and_real_ranges_are_disjoint() {
        let real = BlockNr::real(4242).unwrap();
        let fake = BlockNr::fake_unallocated(4242);
        let shadow = BlockNr::fake_bitmap(7);
        assert!(!real.is_fake());
        assert!(fake.is_fake() && !fake.is_bitmap_shadow());
        assert!(shadow.is_fake() && shadow.is_bitmap_shadow());
        assert_eq!(shadow.bitmap_index(), 7);
        assert_ne!(real, fake);
    }

    #[test]
    fn reserved_nibble_never_reaches_disk() {
        assert!(BlockNr::real(1 << 60).is_none());
        assert!(BlockNr::fake_unallocated(1).encode().is_err());
        assert!(BlockNr::decode((1u64 << 63).to_le_bytes()).is_err());
        let rt = BlockNr::decode(BlockNr::real(99).unwrap().encode().unwrap()).unwrap();
        assert_eq!(rt.raw(), 99);
    }
}
