/*
 * Created on Mon Jan 22 2024
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

//! Space accounting and the allocator plugin surface. Block ownership moves
//! through four stages:
//!
//! ```text
//! NOT_COUNTED -> GRABBED -> UNALLOCATED -> ALLOCATED
//! ```
//!
//! `grab_space` reserves future allocation against the free counter;
//! assigning a fake address moves the reservation to UNALLOCATED; commit
//! turns fake into real and the block becomes ALLOCATED. Release paths
//! exist for every arrow

pub mod bitmap;

use {
    super::{
        block::BlockNr,
        cache::JNodeRef,
        error::{Error, RuntimeResult},
        sb::VolumeSuper,
        znode::TreeLevel,
    },
    parking_lot::{Mutex, RwLock},
    std::collections::BTreeSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStage {
    NotCounted,
    Grabbed,
    Unallocated,
    Allocated,
}

/// Allocation preferences handed to the allocator plugin
#[derive(Debug, Clone, Copy)]
pub struct AllocHint {
    pub preferred: Option<BlockNr>,
    pub max_dist: Option<u64>,
    pub level: TreeLevel,
    pub stage: BlockStage,
    /// accepted but inert: backward allocation sweeps are not implemented
    pub backward: bool,
}

impl Default for AllocHint {
    fn default() -> Self {
        Self {
            preferred: None,
            max_dist: None,
            level: 0,
            stage: BlockStage::Grabbed,
            backward: false,
        }
    }
}

/// Inputs to the allocator's pre-commit work
pub struct CommitHookData<'a> {
    /// fresh real allocations this commit
    pub allocs: &'a [(BlockNr, u64)],
    /// deferred deallocations to apply against the commit bitmap
    pub deletes: &'a BTreeSet<u64>,
}

/// The allocator plugin surface the engine consumes. One implementation
/// ships (the bitmap allocator); the engine never assumes more than this
pub trait SpaceAllocator: Send + Sync + 'static {
    /// Find and mark up to `needed` contiguous free blocks in the working
    /// state. Returns the start and length actually found
    fn alloc_blocks(&self, hint: &AllocHint, needed: u64) -> RuntimeResult<(BlockNr, u64)>;
    /// Return blocks to the working state
    fn dealloc_blocks(&self, start: BlockNr, len: u64);
    /// Debug aid: are all of `[start, start+len)` in the expected state
    fn check_blocks(&self, start: BlockNr, len: u64, allocated: bool) -> bool;
    /// Mirror this commit's allocations and deferred deallocations into the
    /// commit bitmap. Returns the bitmap node handles whose content changed
    /// so the commit pipeline can add them to the overwrite set
    fn pre_commit_hook(
        &self,
        sb: &VolumeSuper,
        data: &CommitHookData<'_>,
    ) -> RuntimeResult<Vec<JNodeRef>>;
    /// The commit record is stable: deferred deallocations leave the
    /// working state too
    fn post_commit_hook(&self, sb: &VolumeSuper, deleted: &[u64]);
    /// Write-back finished: temporary commit blocks (wandered copies, tx
    /// records) go back to the free pool
    fn post_write_back_hook(&self, sb: &VolumeSuper, temps: &[(BlockNr, u64)]);
}

/*
    accounting
*/

#[derive(Debug, Default, Clone, Copy)]
pub struct SpaceCounters {
    /// working free blocks (optimistic, in-memory truth)
    pub free: u64,
    /// reserved by grab_space, not yet assigned
    pub grabbed: u64,
    /// fake-allocated: content exists in memory at a fake address
    pub fake_allocated: u64,
    /// free according to the last commit (what disk says)
    pub free_committed: u64,
}

pub struct SpaceManager {
    counters: Mutex<SpaceCounters>,
    allocator: RwLock<Option<Box<dyn SpaceAllocator>>>,
}

impl SpaceManager {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(SpaceCounters::default()),
            allocator: RwLock::new(None),
        }
    }
    /// Two-phase mount: counters first, the allocator plugin once the
    /// bitmap nodes exist
    pub fn install(&self, allocator: Box<dyn SpaceAllocator>, free: u64) {
        *self.allocator.write() = Some(allocator);
        let mut c = self.counters.lock();
        c.free = free;
        c.free_committed = free;
    }
    pub fn counters(&self) -> SpaceCounters {
        *self.counters.lock()
    }
    pub fn free_blocks(&self) -> u64 {
        self.counters.lock().free
    }
    pub fn grabbed_blocks(&self) -> u64 {
        self.counters.lock().grabbed
    }
    pub fn set_free_committed(&self, n: u64) {
        self.counters.lock().free_committed = n;
    }
    fn with_allocator<T>(&self, f: impl FnOnce(&dyn SpaceAllocator) -> T) -> T {
        let guard = self.allocator.read();
        match guard.as_deref() {
            Some(a) => f(a),
            None => unreachable!("allocator used before install"),
        }
    }
    pub fn allocator_installed(&self) -> bool {
        self.allocator.read().is_some()
    }

    /*
        stage transitions
    */

    /// NOT_COUNTED -> GRABBED. With `can_commit`, a failed reservation
    /// forces a commit (which applies deferred deallocations) and retries
    /// once
    pub fn grab_space(&self, sb: &VolumeSuper, n: u64, can_commit: bool) -> RuntimeResult<()> {
        if self.try_grab(n) {
            super::context::grab_note(n);
            return Ok(());
        }
        if !can_commit {
            return Err(Error::NoSpace);
        }
        super::txn::force_commit_all(sb)?;
        if self.try_grab(n) {
            super::context::grab_note(n);
            Ok(())
        } else {
            Err(Error::NoSpace)
        }
    }
    fn try_grab(&self, n: u64) -> bool {
        let mut c = self.counters.lock();
        if c.free < n {
            return false;
        }
        c.free -= n;
        c.grabbed += n;
        true
    }
    /// GRABBED -> NOT_COUNTED
    pub fn ungrab(&self, n: u64) {
        super::context::grab_unnote(n);
        self.release_grabbed(n);
    }
    /// Counter-only release, used by context close-out
    pub fn release_grabbed(&self, n: u64) {
        let mut c = self.counters.lock();
        dbg_invariant!(c.grabbed >= n);
        c.grabbed -= n;
        c.free += n;
    }
    /// Settle the calling context's outstanding reservation
    pub fn all_grabbed2free(&self) {
        let n = super::context::grab_take();
        if n > 0 {
            self.release_grabbed(n);
        }
    }
    /// GRABBED -> UNALLOCATED (a fake address now names the content)
    pub fn grabbed2fake(&self, n: u64) {
        super::context::grab_unnote(n);
        let mut c = self.counters.lock();
        dbg_invariant!(c.grabbed >= n);
        c.grabbed -= n;
        c.fake_allocated += n;
    }
    /// UNALLOCATED -> NOT_COUNTED (fake content discarded before commit)
    pub fn fake2free(&self, n: u64) {
        let mut c = self.counters.lock();
        dbg_invariant!(c.fake_allocated >= n);
        c.fake_allocated -= n;
        c.free += n;
    }

    /*
        real allocation
    */

    /// Take real blocks out of the working state, paying from `stage`
    /// (GRABBED or UNALLOCATED). Returns (start, got)
    pub fn alloc_real(
        &self,
        hint: &AllocHint,
        needed: u64,
    ) -> RuntimeResult<(BlockNr, u64)> {
        let (start, got) = self.with_allocator(|a| a.alloc_blocks(hint, needed))?;
        let mut c = self.counters.lock();
        match hint.stage {
            BlockStage::Grabbed => {
                super::context::grab_unnote(got);
                dbg_invariant!(c.grabbed >= got);
                c.grabbed -= got;
            }
            BlockStage::Unallocated => {
                dbg_invariant!(c.fake_allocated >= got);
                c.fake_allocated -= got;
            }
            _ => {}
        }
        Ok((start, got))
    }
    /// ALLOCATED -> NOT_COUNTED, immediately (working state)
    pub fn dealloc_real(&self, start: BlockNr, len: u64) {
        self.with_allocator(|a| a.dealloc_blocks(start, len));
        self.counters.lock().free += len;
    }
    pub fn check_blocks(&self, start: BlockNr, len: u64, allocated: bool) -> bool {
        self.with_allocator(|a| a.check_blocks(start, len, allocated))
    }

    /*
        commit hooks (forwarded by the commit pipeline)
    */

    pub fn pre_commit_hook(
        &self,
        sb: &VolumeSuper,
        data: &CommitHookData<'_>,
    ) -> RuntimeResult<Vec<JNodeRef>> {
        self.with_allocator(|a| a.pre_commit_hook(sb, data))
    }
    pub fn post_commit_hook(&self, sb: &VolumeSuper, deleted: &[u64]) {
        self.with_allocator(|a| a.post_commit_hook(sb, deleted));
        self.counters.lock().free += deleted.len() as u64;
    }
    pub fn post_write_back_hook(&self, sb: &VolumeSuper, temps: &[(BlockNr, u64)]) {
        self.with_allocator(|a| a.post_write_back_hook(sb, temps));
        let total: u64 = temps.iter().map(|(_, l)| l).sum();
        self.counters.lock().free += total;
    }

    /*
        emergency flush blocks
    */

    pub fn alloc_eflush_block(&self) -> RuntimeResult<BlockNr> {
        if !self.try_grab(1) {
            return Err(Error::NoSpace);
        }
        let hint = AllocHint {
            stage: BlockStage::Grabbed,
            ..AllocHint::default()
        };
        match self.with_allocator(|a| a.alloc_blocks(&hint, 1)) {
            Ok((start, got)) if got == 1 => {
                let mut c = self.counters.lock();
                c.grabbed -= 1;
                Ok(start)
            }
            Ok((start, got)) => {
                // partial runs cannot happen for a single block
                self.with_allocator(|a| a.dealloc_blocks(start, got));
                self.ungrab(1);
                Err(Error::NoSpace)
            }
            Err(e) => {
                self.ungrab(1);
                Err(e)
            }
        }
    }
    pub fn dealloc_eflush_block(&self, nr: BlockNr) {
        self.dealloc_real(nr, 1);
    }
}

#[cfg(test)]
mod tests;
