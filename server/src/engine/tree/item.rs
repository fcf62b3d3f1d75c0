/*
 * Created on Sat Jan 27 2024
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

//! Item plugins: what the tree stores inside nodes. The engine consumes
//! items strictly through this surface; concrete layouts beyond the three
//! shipped here (stat data, internal downlinks, extents) are somebody
//! else's business

use {
    super::super::{
        block::BlockNr,
        error::{Error, RuntimeResult},
        key::Key,
        vdev::BLOCK_SIZE,
    },
};

pub const ITEM_STATDATA: u16 = 0;
pub const ITEM_INTERNAL: u16 = 1;
pub const ITEM_EXTENT: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitLookup {
    pub unit: usize,
    /// the key falls inside what this item covers
    pub covered: bool,
}

pub trait ItemOps: Send + Sync + 'static {
    fn id(&self) -> u16;
    fn unit_count(&self, body: &[u8]) -> usize;
    /// The greatest key this item speaks for, given the item's own key
    fn max_key_inside(&self, item_key: &Key, body: &[u8]) -> Key;
    /// Locate `key` within this item
    fn lookup_unit(&self, item_key: &Key, key: &Key, body: &[u8]) -> UnitLookup;
}

pub fn item_ops(id: u16) -> RuntimeResult<&'static dyn ItemOps> {
    match id {
        ITEM_STATDATA => Ok(&STATDATA_OPS),
        ITEM_INTERNAL => Ok(&INTERNAL_OPS),
        ITEM_EXTENT => Ok(&EXTENT_OPS),
        _ => Err(Error::Corrupt),
    }
}

/*
    stat data
*/

/// Opaque object metadata; one unit, keyed exactly
pub struct StatDataOps;
pub static STATDATA_OPS: StatDataOps = StatDataOps;

impl ItemOps for StatDataOps {
    fn id(&self) -> u16 {
        ITEM_STATDATA
    }
    fn unit_count(&self, _body: &[u8]) -> usize {
        1
    }
    fn max_key_inside(&self, item_key: &Key, _body: &[u8]) -> Key {
        *item_key
    }
    fn lookup_unit(&self, item_key: &Key, key: &Key, _body: &[u8]) -> UnitLookup {
        UnitLookup {
            unit: 0,
            covered: item_key == key,
        }
    }
}

/*
    internal (downlink)
*/

/// One child pointer. The body may carry a fake address in memory; commit
/// rewrites it before the node ever reaches disk
pub struct InternalOps;
pub static INTERNAL_OPS: InternalOps = InternalOps;

pub const INTERNAL_BODY_SIZE: usize = 8;

pub fn internal_encode(child: BlockNr) -> [u8; INTERNAL_BODY_SIZE] {
    child.raw().to_le_bytes()
}

pub fn internal_child(body: &[u8]) -> BlockNr {
    BlockNr::new(u64::from_le_bytes(body[..8].try_into().unwrap()))
}

pub fn internal_set_child(body: &mut [u8], child: BlockNr) {
    body[..8].copy_from_slice(&child.raw().to_le_bytes());
}

impl ItemOps for InternalOps {
    fn id(&self) -> u16 {
        ITEM_INTERNAL
    }
    fn unit_count(&self, _body: &[u8]) -> usize {
        1
    }
    fn max_key_inside(&self, item_key: &Key, _body: &[u8]) -> Key {
        *item_key
    }
    fn lookup_unit(&self, item_key: &Key, key: &Key, _body: &[u8]) -> UnitLookup {
        UnitLookup {
            unit: 0,
            covered: item_key == key,
        }
    }
}

/*
    extent
*/

/// Twig-level item mapping a run of file offsets onto runs of data blocks.
/// Units are (start, width) pairs, 16 bytes each
pub struct ExtentOps;
pub static EXTENT_OPS: ExtentOps = ExtentOps;

pub const EXTENT_UNIT_SIZE: usize = 16;

pub fn extent_unit(body: &[u8], unit: usize) -> (BlockNr, u64) {
    let at = unit * EXTENT_UNIT_SIZE;
    (
        BlockNr::new(u64::from_le_bytes(body[at..at + 8].try_into().unwrap())),
        u64::from_le_bytes(body[at + 8..at + 16].try_into().unwrap()),
    )
}

pub fn extent_encode(units: &[(BlockNr, u64)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(units.len() * EXTENT_UNIT_SIZE);
    for (start, width) in units {
        body.extend_from_slice(&start.raw().to_le_bytes());
        body.extend_from_slice(&width.to_le_bytes());
    }
    body
}

/// Total blocks an extent item covers
pub fn extent_width(body: &[u8]) -> u64 {
    (0..body.len() / EXTENT_UNIT_SIZE)
        .map(|u| extent_unit(body, u).1)
        .sum()
}

impl ItemOps for ExtentOps {
    fn id(&self) -> u16 {
        ITEM_EXTENT
    }
    fn unit_count(&self, body: &[u8]) -> usize {
        body.len() / EXTENT_UNIT_SIZE
    }
    fn max_key_inside(&self, item_key: &Key, body: &[u8]) -> Key {
        let span = extent_width(body) * BLOCK_SIZE as u64;
        item_key.set_offset(item_key.offset() + span.saturating_sub(1))
    }
    fn lookup_unit(&self, item_key: &Key, key: &Key, body: &[u8]) -> UnitLookup {
        dbg_invariant!(key.offset() >= item_key.offset());
        let delta_blocks = (key.offset() - item_key.offset()) / BLOCK_SIZE as u64;
        let mut covered_so_far = 0;
        let n = self.unit_count(body);
        for unit in 0..n {
            let (_, width) = extent_unit(body, unit);
            if delta_blocks < covered_so_far + width {
                return UnitLookup {
                    unit,
                    covered: true,
                };
            }
            covered_so_far += width;
        }
        UnitLookup {
            unit: n.saturating_sub(1),
            covered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::engine::key::{Key, KeyType},
    };

    #[test]
    fn extent_unit_walk() {
        let body = extent_encode(&[
            (BlockNr::new(100), 50),
            (BlockNr::new(400), 25),
        ]);
        let ik = Key::build(1, KeyType::FileBody, 42, 0);
        assert_eq!(EXTENT_OPS.unit_count(&body), 2);
        assert_eq!(extent_width(&body), 75);
        // inside unit 0
        let probe = ik.set_offset(30 * BLOCK_SIZE as u64);
        let r = EXTENT_OPS.lookup_unit(&ik, &probe, &body);
        assert!(r.covered);
        assert_eq!(r.unit, 0);
        // inside unit 1
        let probe = ik.set_offset(60 * BLOCK_SIZE as u64);
        let r = EXTENT_OPS.lookup_unit(&ik, &probe, &body);
        assert!(r.covered);
        assert_eq!(r.unit, 1);
        // beyond: settles after the last unit
        let probe = ik.set_offset(200 * BLOCK_SIZE as u64);
        let r = EXTENT_OPS.lookup_unit(&ik, &probe, &body);
        assert!(!r.covered);
        assert_eq!(r.unit, 1);
        // max key inside covers the full span
        let mk = EXTENT_OPS.max_key_inside(&ik, &body);
        assert_eq!(mk.offset(), 75 * BLOCK_SIZE as u64 - 1);
    }

    #[test]
    fn internal_body_roundtrip() {
        let body = internal_encode(BlockNr::new(777));
        assert_eq!(internal_child(&body).raw(), 777);
        let mut body = body.to_vec();
        internal_set_child(&mut body, BlockNr::new(778));
        assert_eq!(internal_child(&body).raw(), 778);
    }
}
