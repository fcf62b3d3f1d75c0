/*
 * Created on Sat Jan 13 2024
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

//! The page cache. Every block the engine touches is staged through a
//! [`Page`]; node handles bind to pages symmetrically (the jnode holds the
//! page, the page's private slot points back) under page-lock + jnode-lock

use {
    super::{BlockDevice, BLOCK_SIZE},
    crate::engine::{block::BlockNr, cache::JNode, error::RuntimeResult},
    core::sync::atomic::{AtomicU32, Ordering},
    parking_lot::{Condvar, Mutex, RwLock},
    std::{
        cell::UnsafeCell,
        collections::HashMap,
        sync::{Arc, Weak},
    },
};

/// Names an address space inside the volume. Unformatted pages belong to
/// their owning object; formatted tree nodes, bitmap blocks and journal
/// staging blocks live in per-purpose spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingId {
    Formatted,
    Bitmap,
    IoHead,
    Object(u64),
}

consts! {
    pub PG_UPTODATE: u32 = 1 << 0;
    pub PG_DIRTY: u32 = 1 << 1;
    pub PG_PRIVATE: u32 = 1 << 2;
    pub PG_ERROR: u32 = 1 << 3;
    pub PG_WRITEBACK: u32 = 1 << 4;
}

struct PageLock {
    locked: Mutex<bool>,
    cv: Condvar,
}

pub struct Page {
    mapping: MappingId,
    index: u64,
    flags: AtomicU32,
    lck: PageLock,
    // back-pointer to the owning jnode; a weak token, never an owner
    private: Mutex<Option<Weak<JNode>>>,
    buf: UnsafeCell<Box<[u8]>>,
}

// the buffer is only touched under the page lock (i/o) or while the owner
// holds a long-term lock on the node's content
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    fn new(mapping: MappingId, index: u64) -> Arc<Self> {
        Arc::new(Self {
            mapping,
            index,
            flags: AtomicU32::new(0),
            lck: PageLock {
                locked: Mutex::new(false),
                cv: Condvar::new(),
            },
            private: Mutex::new(None),
            buf: UnsafeCell::new(vec![0u8; BLOCK_SIZE].into_boxed_slice()),
        })
    }
    pub fn mapping(&self) -> MappingId {
        self.mapping
    }
    pub fn index(&self) -> u64 {
        self.index
    }
    // flags
    pub fn test(&self, bit: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }
    pub fn set(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }
    pub fn clear(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }
    // page lock
    pub fn lock(&self) {
        let mut locked = self.lck.locked.lock();
        while *locked {
            self.lck.cv.wait(&mut locked);
        }
        *locked = true;
    }
    pub fn try_lock(&self) -> bool {
        let mut locked = self.lck.locked.lock();
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }
    pub fn unlock(&self) {
        let mut locked = self.lck.locked.lock();
        dbg_invariant!(*locked);
        *locked = false;
        drop(locked);
        self.lck.cv.notify_one();
    }
    pub fn is_locked(&self) -> bool {
        *self.lck.locked.lock()
    }
    // private (jnode back-pointer)
    pub fn set_private(&self, j: &Arc<JNode>) {
        *self.private.lock() = Some(Arc::downgrade(j));
        self.set(PG_PRIVATE);
    }
    pub fn clear_private(&self) {
        self.clear(PG_PRIVATE);
        *self.private.lock() = None;
    }
    pub fn private(&self) -> Option<Arc<JNode>> {
        self.private.lock().as_ref().and_then(Weak::upgrade)
    }
    // data
    /// ## Safety
    /// Caller must hold the page lock (i/o paths) or a long-term lock that
    /// serializes all access to this block's content
    pub unsafe fn data<'a>(&'a self) -> &'a [u8] {
        &(&*self.buf.get())[..]
    }
    /// ## Safety
    /// Same contract as [`Page::data`], write-exclusive
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut<'a>(&'a self) -> &'a mut [u8] {
        &mut (&mut *self.buf.get())[..]
    }
    /// Fill the page from `src` and mark it uptodate. Needs the page lock
    pub fn fill(&self, src: &[u8]) {
        dbg_invariant!(self.is_locked());
        unsafe {
            // UNSAFE(@ohsayan): page lock held per the fill contract
            self.data_mut()[..src.len()].copy_from_slice(src)
        }
        self.set(PG_UPTODATE);
    }
    /// Read the page in from the device. Needs the page lock
    pub fn read_from(&self, dev: &dyn BlockDevice, nr: BlockNr) -> RuntimeResult<()> {
        dbg_invariant!(self.is_locked());
        let res = dev.read_block(nr, unsafe {
            // UNSAFE(@ohsayan): page lock held per the i/o contract
            self.data_mut()
        });
        match res {
            Ok(()) => {
                self.clear(PG_ERROR);
                self.set(PG_UPTODATE);
                Ok(())
            }
            Err(e) => {
                self.set(PG_ERROR);
                Err(e)
            }
        }
    }
    /// Write the page out to the device. Needs the page lock
    pub fn write_to(&self, dev: &dyn BlockDevice, nr: BlockNr) -> RuntimeResult<()> {
        dbg_invariant!(self.is_locked());
        let res = dev.write_block(nr, unsafe {
            // UNSAFE(@ohsayan): page lock held per the i/o contract
            self.data()
        });
        if res.is_err() {
            self.set(PG_ERROR);
        }
        res
    }
}

/*
    page cache
*/

pub struct PageCache {
    pages: RwLock<HashMap<(MappingId, u64), Arc<Page>>>,
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
        }
    }
    pub fn find(&self, mapping: MappingId, index: u64) -> Option<Arc<Page>> {
        self.pages.read().get(&(mapping, index)).cloned()
    }
    pub fn find_or_create(&self, mapping: MappingId, index: u64) -> Arc<Page> {
        if let Some(pg) = self.find(mapping, index) {
            return pg;
        }
        let mut w = self.pages.write();
        w.entry((mapping, index))
            .or_insert_with(|| Page::new(mapping, index))
            .clone()
    }
    /// Drop a page from the cache. The page itself stays alive for as long
    /// as somebody holds it
    pub fn remove(&self, mapping: MappingId, index: u64) -> Option<Arc<Page>> {
        self.pages.write().remove(&(mapping, index))
    }
    /// Drop every page of an address space (object truncate/kill)
    pub fn drop_mapping(&self, mapping: MappingId) {
        self.pages.write().retain(|(m, _), _| *m != mapping);
    }
    pub fn len(&self) -> usize {
        self.pages.read().len()
    }
    /// Pages of `mapping` currently dirty. Order is meaningless
    pub fn dirty_of(&self, mapping: MappingId) -> Vec<Arc<Page>> {
        self.pages
            .read()
            .iter()
            .filter(|((m, _), pg)| *m == mapping && pg.test(PG_DIRTY))
            .map(|(_, pg)| pg.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_or_create_is_idempotent() {
        let pc = PageCache::new();
        let a = pc.find_or_create(MappingId::Formatted, 9);
        let b = pc.find_or_create(MappingId::Formatted, 9);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pc.len(), 1);
    }

    #[test]
    fn mappings_are_disjoint() {
        let pc = PageCache::new();
        pc.find_or_create(MappingId::Object(1), 0);
        pc.find_or_create(MappingId::Object(2), 0);
        pc.find_or_create(MappingId::Bitmap, 0);
        assert_eq!(pc.len(), 3);
        pc.drop_mapping(MappingId::Object(1));
        assert_eq!(pc.len(), 2);
        assert!(pc.find(MappingId::Object(1), 0).is_none());
    }

    #[test]
    fn page_lock_excludes() {
        let pc = PageCache::new();
        let pg = pc.find_or_create(MappingId::Formatted, 0);
        pg.lock();
        assert!(!pg.try_lock());
        pg.unlock();
        assert!(pg.try_lock());
        pg.unlock();
    }
}
