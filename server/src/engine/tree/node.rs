/*
 * Created on Fri Jan 26 2024
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

//! The node-layout plugin surface and the one shipped layout. A formatted
//! node is a header, an array of item heads growing up from it, and item
//! bodies packed down from the end of the block:
//!
//! ```text
//! +--------+----------+----------+---~~~---+--------+--------+
//! | header | ihead 0  | ihead 1  |  free   | body 1 | body 0 |
//! +--------+----------+----------+---~~~---+--------+--------+
//! ```

use {
    super::super::{
        cache::{JNodeRef, JN_CREATED, JN_NEW},
        error::{Error, RuntimeResult},
        key::Key,
        sb::VolumeSuper,
        vdev::BLOCK_SIZE,
        znode::{TreeLevel, MAX_TREE_HEIGHT},
    },
    core::ops::Range,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Exact,
    MaxNotMoreThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLookup {
    /// greatest item whose key is not above the search key; 0 when the
    /// search key sorts below everything
    pub pos: usize,
    pub found: bool,
    /// search key sorts below item 0
    pub before_first: bool,
}

/// What the traversal and edit paths consume. One implementation ships;
/// the disk id in the node header keeps the door open
pub trait NodeOps: Send + Sync + 'static {
    fn id(&self) -> u16;
    fn init(&self, data: &mut [u8], level: TreeLevel, large_keys: bool);
    /// Validate a freshly read node, returning its level
    fn parse(&self, data: &[u8], large_keys: bool) -> RuntimeResult<TreeLevel>;
    fn level(&self, data: &[u8]) -> TreeLevel;
    fn num_items(&self, data: &[u8]) -> usize;
    fn free_space(&self, data: &[u8], large_keys: bool) -> usize;
    fn item_key(&self, data: &[u8], pos: usize, large_keys: bool) -> Key;
    fn item_plugin(&self, data: &[u8], pos: usize, large_keys: bool) -> u16;
    fn item_body<'a>(&self, data: &'a [u8], pos: usize, large_keys: bool) -> &'a [u8];
    fn item_body_mut<'a>(&self, data: &'a mut [u8], pos: usize, large_keys: bool)
        -> &'a mut [u8];
    fn lookup(&self, data: &[u8], key: &Key, large_keys: bool) -> NodeLookup;
    fn insert_item(
        &self,
        data: &mut [u8],
        pos: usize,
        key: &Key,
        plugin: u16,
        body: &[u8],
        large_keys: bool,
    ) -> RuntimeResult<()>;
    fn remove_item(&self, data: &mut [u8], pos: usize, large_keys: bool);
    /// Per-item space overhead beyond the body
    fn overhead(&self, large_keys: bool) -> usize;
}

/*
    the shipped layout
*/

const NODE_MAGIC: u32 = 0x5346_4e31;
const HDR_SIZE: usize = 16;
const OFF_MAGIC: Range<usize> = 0..4;
const OFF_PLUGIN: Range<usize> = 4..6;
const OFF_LEVEL: usize = 6;
const OFF_NUM_ITEMS: Range<usize> = 8..10;
const OFF_FREE_END: Range<usize> = 10..12;

pub struct Layout40;

pub static LAYOUT40: Layout40 = Layout40;

pub const NODE_PLUGIN_LAYOUT40: u16 = 0;

pub fn node_ops(id: u16) -> RuntimeResult<&'static dyn NodeOps> {
    match id {
        NODE_PLUGIN_LAYOUT40 => Ok(&LAYOUT40),
        _ => Err(Error::Corrupt),
    }
}

impl Layout40 {
    fn head_size(large: bool) -> usize {
        Key::disk_size(large) + 6
    }
    fn head_at(data: &[u8], pos: usize, large: bool) -> usize {
        HDR_SIZE + pos * Self::head_size(large)
    }
    fn read_u16(data: &[u8], r: Range<usize>) -> u16 {
        u16::from_le_bytes(data[r].try_into().unwrap())
    }
    fn write_u16(data: &mut [u8], r: Range<usize>, v: u16) {
        data[r].copy_from_slice(&v.to_le_bytes());
    }
    fn item_span(data: &[u8], pos: usize, large: bool) -> (usize, usize) {
        let h = Self::head_at(data, pos, large);
        let ks = Key::disk_size(large);
        let off = Self::read_u16(data, h + ks + 2..h + ks + 4) as usize;
        let len = Self::read_u16(data, h + ks + 4..h + ks + 6) as usize;
        (off, len)
    }
    fn n_items(data: &[u8]) -> usize {
        Self::read_u16(data, OFF_NUM_ITEMS) as usize
    }
    fn free_start(data: &[u8], large: bool) -> usize {
        Self::head_at(data, Self::n_items(data), large)
    }
    /// Pull every item out (used by node splits, which rebuild both halves)
    pub fn drain_items(&self, data: &[u8], large: bool) -> Vec<(Key, u16, Vec<u8>)> {
        (0..self.num_items(data))
            .map(|pos| {
                (
                    self.item_key(data, pos, large),
                    self.item_plugin(data, pos, large),
                    self.item_body(data, pos, large).to_vec(),
                )
            })
            .collect()
    }
}

impl NodeOps for Layout40 {
    fn id(&self) -> u16 {
        NODE_PLUGIN_LAYOUT40
    }
    fn init(&self, data: &mut [u8], level: TreeLevel, _large_keys: bool) {
        data[..HDR_SIZE].fill(0);
        data[OFF_MAGIC].copy_from_slice(&NODE_MAGIC.to_le_bytes());
        Self::write_u16(data, OFF_PLUGIN, NODE_PLUGIN_LAYOUT40);
        data[OFF_LEVEL] = level;
        Self::write_u16(data, OFF_NUM_ITEMS, 0);
        Self::write_u16(data, OFF_FREE_END, BLOCK_SIZE as u16);
    }
    fn parse(&self, data: &[u8], large_keys: bool) -> RuntimeResult<TreeLevel> {
        if u32::from_le_bytes(data[OFF_MAGIC].try_into().unwrap()) != NODE_MAGIC {
            return Err(Error::Corrupt);
        }
        if Self::read_u16(data, OFF_PLUGIN) != NODE_PLUGIN_LAYOUT40 {
            return Err(Error::Corrupt);
        }
        let level = data[OFF_LEVEL];
        if level == 0 || level > MAX_TREE_HEIGHT {
            return Err(Error::Corrupt);
        }
        let n = self.num_items(data);
        let free_end = Self::read_u16(data, OFF_FREE_END) as usize;
        if Self::head_at(data, n, large_keys) > free_end || free_end > BLOCK_SIZE {
            return Err(Error::Corrupt);
        }
        for pos in 0..n {
            let (off, len) = Self::item_span(data, pos, large_keys);
            if off < free_end || off + len > BLOCK_SIZE {
                return Err(Error::Corrupt);
            }
        }
        Ok(level)
    }
    fn level(&self, data: &[u8]) -> TreeLevel {
        data[OFF_LEVEL]
    }
    fn num_items(&self, data: &[u8]) -> usize {
        Self::read_u16(data, OFF_NUM_ITEMS) as usize
    }
    fn free_space(&self, data: &[u8], large_keys: bool) -> usize {
        let free_end = Self::read_u16(data, OFF_FREE_END) as usize;
        free_end - Self::free_start(data, large_keys)
    }
    fn item_key(&self, data: &[u8], pos: usize, large_keys: bool) -> Key {
        let h = Self::head_at(data, pos, large_keys);
        Key::decode(&data[h..h + Key::disk_size(large_keys)], large_keys)
    }
    fn item_plugin(&self, data: &[u8], pos: usize, large_keys: bool) -> u16 {
        let h = Self::head_at(data, pos, large_keys);
        let ks = Key::disk_size(large_keys);
        Self::read_u16(data, h + ks..h + ks + 2)
    }
    fn item_body<'a>(&self, data: &'a [u8], pos: usize, large_keys: bool) -> &'a [u8] {
        let (off, len) = Self::item_span(data, pos, large_keys);
        &data[off..off + len]
    }
    fn item_body_mut<'a>(
        &self,
        data: &'a mut [u8],
        pos: usize,
        large_keys: bool,
    ) -> &'a mut [u8] {
        let (off, len) = Self::item_span(data, pos, large_keys);
        &mut data[off..off + len]
    }
    fn lookup(&self, data: &[u8], key: &Key, large_keys: bool) -> NodeLookup {
        let n = self.num_items(data);
        if n == 0 {
            return NodeLookup {
                pos: 0,
                found: false,
                before_first: true,
            };
        }
        // greatest item with item_key <= key
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.item_key(data, mid, large_keys) <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return NodeLookup {
                pos: 0,
                found: false,
                before_first: true,
            };
        }
        let pos = lo - 1;
        NodeLookup {
            pos,
            found: self.item_key(data, pos, large_keys) == *key,
            before_first: false,
        }
    }
    fn insert_item(
        &self,
        data: &mut [u8],
        pos: usize,
        key: &Key,
        plugin: u16,
        body: &[u8],
        large_keys: bool,
    ) -> RuntimeResult<()> {
        let n = self.num_items(data);
        dbg_invariant!(pos <= n);
        let hs = Self::head_size(large_keys);
        let free_end = Self::read_u16(data, OFF_FREE_END) as usize;
        let free_start = Self::free_start(data, large_keys);
        if free_start + hs + body.len() > free_end {
            return Err(Error::NoSpace);
        }
        // shift heads right of pos
        let src = Self::head_at(data, pos, large_keys);
        let end = Self::head_at(data, n, large_keys);
        data.copy_within(src..end, src + hs);
        // write the new head
        let ks = Key::disk_size(large_keys);
        let body_off = free_end - body.len();
        key.encode_into(&mut data[src..src + ks], large_keys);
        Self::write_u16(data, src + ks..src + ks + 2, plugin);
        Self::write_u16(data, src + ks + 2..src + ks + 4, body_off as u16);
        Self::write_u16(data, src + ks + 4..src + ks + 6, body.len() as u16);
        // body + counters
        data[body_off..body_off + body.len()].copy_from_slice(body);
        Self::write_u16(data, OFF_NUM_ITEMS, (n + 1) as u16);
        Self::write_u16(data, OFF_FREE_END, body_off as u16);
        Ok(())
    }
    fn remove_item(&self, data: &mut [u8], pos: usize, large_keys: bool) {
        let n = self.num_items(data);
        dbg_invariant!(pos < n);
        let (off, len) = Self::item_span(data, pos, large_keys);
        let free_end = Self::read_u16(data, OFF_FREE_END) as usize;
        // drop the head
        let hs = Self::head_size(large_keys);
        let src = Self::head_at(data, pos + 1, large_keys);
        let end = Self::head_at(data, n, large_keys);
        data.copy_within(src..end, src - hs);
        Self::write_u16(data, OFF_NUM_ITEMS, (n - 1) as u16);
        if len > 0 {
            // compact bodies below the removed one and refit their offsets
            data.copy_within(free_end..off, free_end + len);
            for p in 0..n - 1 {
                let h = Self::head_at(data, p, large_keys);
                let ks = Key::disk_size(large_keys);
                let o = Self::read_u16(data, h + ks + 2..h + ks + 4) as usize;
                if o < off {
                    Self::write_u16(data, h + ks + 2..h + ks + 4, (o + len) as u16);
                }
            }
        }
        Self::write_u16(data, OFF_FREE_END, (free_end + len) as u16);
    }
    fn overhead(&self, large_keys: bool) -> usize {
        Self::head_size(large_keys)
    }
}

/*
    znode parse hook (jnode type vtable)
*/

/// Validate a formatted node's content and resolve its layout plugin.
/// Fresh in-memory nodes skip validation; `edit::zinit_new` formats them
pub fn parse_znode(sb: &VolumeSuper, j: &JNodeRef) -> RuntimeResult<()> {
    if j.test(JN_CREATED) || j.test(JN_NEW) || j.blocknr().is_fake() {
        return Ok(());
    }
    let pg = match j.page() {
        Some(p) => p,
        None => return Err(Error::Corrupt),
    };
    let data = unsafe {
        // UNSAFE(@ohsayan): called from jload with the page uptodate and
        // the node's data pinned
        pg.data()
    };
    let level = LAYOUT40.parse(data, sb.large_keys())?;
    if j.z().level() != 0 && j.z().level() != level {
        return Err(Error::Corrupt);
    }
    j.z().set_nplug(NODE_PLUGIN_LAYOUT40);
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::engine::key::{Key, KeyType},
    };

    fn fresh() -> Vec<u8> {
        let mut data = vec![0u8; BLOCK_SIZE];
        LAYOUT40.init(&mut data, 1, false);
        data
    }

    #[test]
    fn init_parse_roundtrip() {
        let data = fresh();
        assert_eq!(LAYOUT40.parse(&data, false).unwrap(), 1);
        assert_eq!(LAYOUT40.num_items(&data), 0);
    }

    #[test]
    fn insert_lookup_remove() {
        let mut data = fresh();
        let keys: Vec<Key> = (0..8u64)
            .map(|i| Key::build(1, KeyType::StatData, i * 2, 0))
            .collect();
        for (i, k) in keys.iter().enumerate() {
            LAYOUT40
                .insert_item(&mut data, i, k, 0, &[i as u8; 10], false)
                .unwrap();
        }
        assert_eq!(LAYOUT40.num_items(&data), 8);
        // exact hit
        let r = LAYOUT40.lookup(&data, &keys[3], false);
        assert!(r.found);
        assert_eq!(r.pos, 3);
        assert_eq!(LAYOUT40.item_body(&data, 3, false), &[3u8; 10]);
        // between keys: settles on the item below
        let probe = Key::build(1, KeyType::StatData, 5, 0);
        let r = LAYOUT40.lookup(&data, &probe, false);
        assert!(!r.found);
        assert_eq!(r.pos, 2);
        // below every key
        let low = Key::build(0, KeyType::StatData, 0, 0);
        assert!(LAYOUT40.lookup(&data, &low, false).before_first);
        // removal compacts
        let free_before = LAYOUT40.free_space(&data, false);
        LAYOUT40.remove_item(&mut data, 3, false);
        assert_eq!(LAYOUT40.num_items(&data), 7);
        assert!(LAYOUT40.free_space(&data, false) > free_before);
        let r = LAYOUT40.lookup(&data, &keys[4], false);
        assert!(r.found);
        assert_eq!(LAYOUT40.item_body(&data, r.pos, false), &[4u8; 10]);
        assert!(LAYOUT40.parse(&data, false).is_ok());
    }

    #[test]
    fn insert_refuses_overflow() {
        let mut data = fresh();
        let body = vec![0u8; 1000];
        let mut pos = 0;
        loop {
            let k = Key::build(1, KeyType::FileBody, pos as u64, 0);
            match LAYOUT40.insert_item(&mut data, pos, &k, 0, &body, false) {
                Ok(()) => pos += 1,
                Err(Error::NoSpace) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(pos >= 3);
        assert!(LAYOUT40.parse(&data, false).is_ok());
    }
}
