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

//! The balanced tree: one tree per volume, every object in it, ordered by
//! compound key. This module owns the tree handle (locks, hash tables, the
//! root pointer, the lookup cache); traversal lives in `search`, structure
//! changes in `edit`

pub mod edit;
pub mod item;
pub mod node;
pub mod search;
pub mod seal;
pub mod sibling;

use {
    super::{
        block::BlockNr,
        cache::{table::JTable, JNode, JNodeRef},
        lock::rank::{self, Rank, RankGuard},
        sync::ORD_RLX,
        znode::TreeLevel,
    },
    core::sync::atomic::AtomicU64,
    parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
    std::{
        collections::VecDeque,
        sync::{Arc, Weak},
    },
};

/*
    coords
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where a coord sits relative to the (item, unit) it names
pub enum Between {
    AtUnit,
    AfterUnit,
    BeforeUnit,
    AfterItem,
    BeforeItem,
    EmptyNode,
    Invalid,
}

/// A position in the tree: node + item + unit + side tag
#[derive(Clone)]
pub struct Coord {
    pub node: JNodeRef,
    pub item_pos: u16,
    pub unit_pos: u16,
    pub between: Between,
}

impl Coord {
    pub fn at(node: JNodeRef, item_pos: u16, unit_pos: u16) -> Self {
        Self {
            node,
            item_pos,
            unit_pos,
            between: Between::AtUnit,
        }
    }
    pub fn is_existing_unit(&self) -> bool {
        self.between == Between::AtUnit
    }
}

/*
    cbk cache
*/

/// LRU of nodes recent searches ended in. Slots are weak: a dead node
/// simply stops hitting
pub struct CbkCache {
    slots: Mutex<VecDeque<Weak<JNode>>>,
    nr_slots: usize,
}

impl CbkCache {
    pub fn new(nr_slots: usize) -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            nr_slots: nr_slots.max(1),
        }
    }
    /// Snapshot, MRU first
    pub fn snapshot(&self) -> Vec<JNodeRef> {
        self.slots
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
    /// Bump (or insert) a node to MRU
    pub fn bump(&self, j: &JNodeRef) {
        let mut slots = self.slots.lock();
        slots.retain(|w| match w.upgrade() {
            Some(n) => !Arc::ptr_eq(&n, j),
            None => false,
        });
        slots.push_front(Arc::downgrade(j));
        while slots.len() > self.nr_slots {
            slots.pop_back();
        }
    }
    /// Drop a dying node from the cache
    pub fn invalidate(&self, j: &JNodeRef) {
        self.slots.lock().retain(|w| match w.upgrade() {
            Some(n) => !Arc::ptr_eq(&n, j),
            None => false,
        });
    }
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/*
    the tree handle
*/

struct RootInfo {
    block: BlockNr,
    height: TreeLevel,
}

/// Ranked witnesses for the tree-wide short-term locks
pub struct TreeReadGuard<'a> {
    _rank: RankGuard,
    _g: RwLockReadGuard<'a, ()>,
}

pub struct TreeWriteGuard<'a> {
    _rank: RankGuard,
    _g: RwLockWriteGuard<'a, ()>,
}

pub struct DkGuard<'a> {
    _rank: RankGuard,
    _g: MutexGuard<'a, ()>,
}

pub struct Tree {
    /// the tree lock: hash insertion, parent pointers, sibling links
    rw: RwLock<()>,
    /// serializes multi-node delimiting-key updates
    dk_guard: Mutex<()>,
    ztable: JTable,
    jtable: JTable,
    cbk: CbkCache,
    root: Mutex<RootInfo>,
    uber: Mutex<Option<JNodeRef>>,
    version: AtomicU64,
}

impl Tree {
    pub fn new(buckets: usize, cbk_slots: usize) -> Self {
        Self {
            rw: RwLock::new(()),
            dk_guard: Mutex::new(()),
            ztable: JTable::with_buckets(buckets),
            jtable: JTable::with_buckets(buckets),
            cbk: CbkCache::new(cbk_slots),
            root: Mutex::new(RootInfo {
                block: BlockNr::new(0),
                height: 0,
            }),
            uber: Mutex::new(None),
            version: AtomicU64::new(1),
        }
    }
    pub fn lock_read(&self) -> TreeReadGuard<'_> {
        TreeReadGuard {
            _rank: rank::enter(Rank::TreeRead),
            _g: self.rw.read(),
        }
    }
    pub fn lock_write(&self) -> TreeWriteGuard<'_> {
        TreeWriteGuard {
            _rank: rank::enter(Rank::TreeWrite),
            _g: self.rw.write(),
        }
    }
    pub fn dk_guard(&self) -> DkGuard<'_> {
        DkGuard {
            _rank: rank::enter(Rank::Dk),
            _g: self.dk_guard.lock(),
        }
    }
    pub fn ztable(&self) -> &JTable {
        &self.ztable
    }
    pub fn jtable(&self) -> &JTable {
        &self.jtable
    }
    pub fn cbk(&self) -> &CbkCache {
        &self.cbk
    }
    pub fn root_info(&self) -> (BlockNr, TreeLevel) {
        let r = self.root.lock();
        (r.block, r.height)
    }
    pub fn set_root(&self, block: BlockNr, height: TreeLevel) {
        let mut r = self.root.lock();
        r.block = block;
        r.height = height;
    }
    pub fn set_root_block(&self, block: BlockNr) {
        self.root.lock().block = block;
    }
    pub fn height(&self) -> TreeLevel {
        self.root.lock().height
    }
    pub fn uber(&self) -> JNodeRef {
        extract!(self.uber.lock().clone(), Some(u) => u)
    }
    pub fn set_uber(&self, uber: JNodeRef) {
        *self.uber.lock() = Some(uber);
    }
    pub fn clear_uber(&self) {
        *self.uber.lock() = None;
    }
    /// Monotone per-tree epoch. Stamped on znodes at creation and bumped by
    /// content edits (seals key off it)
    pub fn next_version(&self) -> u64 {
        self.version.fetch_add(1, ORD_RLX) + 1
    }
}
