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

//! Compound tree keys. A key names everything the tree stores: stat data,
//! directory entries, file bodies. Ordering is lexicographic over
//! (locality, minor type, [ordering,] objectid, offset), which is what packs
//! related objects next to each other on disk.
//!
//! In memory a key always carries four words; the fs-wide `LARGE_KEYS` flag
//! only decides whether the ordering word travels to disk (4 x u64) or is
//! dropped from the codec (3 x u64)

use core::fmt;

/// Minor key type: what kind of thing lives at this key. The discriminants
/// are stable on-disk values; gaps are reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum KeyType {
    /// object metadata
    StatData = 0x0,
    /// directory entry
    DirEntry = 0x1,
    /// file body (tails and extents)
    FileBody = 0x4,
    /// not a real key type; compares above every real one
    Max = 0xf,
}

impl KeyType {
    pub const fn from_nibble(n: u8) -> Self {
        match n {
            0x0 => KeyType::StatData,
            0x1 => KeyType::DirEntry,
            0x4 => KeyType::FileBody,
            _ => KeyType::Max,
        }
    }
}

const LOCALITY_SHIFT: u32 = 4;
const TYPE_MASK: u64 = 0xf;

/// Word layout: `[locality|type, ordering, objectid, offset]`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    w: [u64; 4],
}

/// Size of a key on disk without the ordering word
pub const KEY_DISK_SIZE_SMALL: usize = 24;
/// Size of a key on disk with the ordering word
pub const KEY_DISK_SIZE_LARGE: usize = 32;

/// Compares below every valid key
pub const MIN_KEY: Key = Key { w: [0; 4] };
/// Compares above every valid key
pub const MAX_KEY: Key = Key { w: [u64::MAX; 4] };

impl Key {
    pub const fn build(locality: u64, typ: KeyType, objectid: u64, offset: u64) -> Self {
        Self {
            w: [
                (locality << LOCALITY_SHIFT) | typ as u64,
                0,
                objectid,
                offset,
            ],
        }
    }
    pub const fn with_ordering(mut self, ordering: u64) -> Self {
        self.w[1] = ordering;
        self
    }
    pub const fn locality(&self) -> u64 {
        self.w[0] >> LOCALITY_SHIFT
    }
    pub const fn typ(&self) -> KeyType {
        KeyType::from_nibble((self.w[0] & TYPE_MASK) as u8)
    }
    pub const fn ordering(&self) -> u64 {
        self.w[1]
    }
    pub const fn objectid(&self) -> u64 {
        self.w[2]
    }
    pub const fn offset(&self) -> u64 {
        self.w[3]
    }
    pub const fn set_offset(mut self, offset: u64) -> Self {
        self.w[3] = offset;
        self
    }
    /// The greatest key sharing this key's object identity. Used to bound
    /// per-object scans
    pub const fn object_max(&self) -> Self {
        Self {
            w: [self.w[0], self.w[1], self.w[2], u64::MAX],
        }
    }
    pub fn encode_into(&self, buf: &mut [u8], large: bool) {
        let mut at = 0;
        for (i, w) in self.w.iter().enumerate() {
            if i == 1 && !large {
                continue;
            }
            buf[at..at + 8].copy_from_slice(&w.to_le_bytes());
            at += 8;
        }
    }
    pub fn decode(buf: &[u8], large: bool) -> Self {
        let mut w = [0u64; 4];
        let mut at = 0;
        for (i, slot) in w.iter_mut().enumerate() {
            if i == 1 && !large {
                continue;
            }
            *slot = u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
            at += 8;
        }
        Self { w }
    }
    pub const fn disk_size(large: bool) -> usize {
        if large {
            KEY_DISK_SIZE_LARGE
        } else {
            KEY_DISK_SIZE_SMALL
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:x}:{:?}:{:x}:{:x})",
            self.locality(),
            self.typ(),
            self.objectid(),
            self.offset()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic() {
        let a = Key::build(1, KeyType::StatData, 10, 0);
        let b = Key::build(1, KeyType::DirEntry, 2, 0);
        let c = Key::build(1, KeyType::DirEntry, 2, 5);
        let d = Key::build(2, KeyType::StatData, 0, 0);
        assert!(a < b && b < c && c < d);
        assert!(MIN_KEY < a && d < MAX_KEY);
    }

    #[test]
    fn min_max_are_absolute() {
        let probe = Key::build(u64::MAX >> LOCALITY_SHIFT, KeyType::FileBody, u64::MAX, 1);
        assert!(MIN_KEY <= MIN_KEY && probe < MAX_KEY);
        assert_eq!(MIN_KEY.cmp(&MIN_KEY), core::cmp::Ordering::Equal);
    }

    #[test]
    fn disk_codec_small_and_large() {
        let k = Key::build(42, KeyType::FileBody, 0xdead, 4096).with_ordering(77);
        let mut small = [0u8; KEY_DISK_SIZE_SMALL];
        let mut large = [0u8; KEY_DISK_SIZE_LARGE];
        k.encode_into(&mut small, false);
        k.encode_into(&mut large, true);
        let ks = Key::decode(&small, false);
        let kl = Key::decode(&large, true);
        // the small codec drops the ordering word
        assert_eq!(ks.ordering(), 0);
        assert_eq!(ks.objectid(), 0xdead);
        assert_eq!(kl, k);
    }
}
