/*
 * Created on Tue Jan 23 2024
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

//! The bitmap allocator plugin. Every bitmap block exists twice: the
//! *working* copy is modified in place as blocks come and go; the *commit*
//! copy (the bitmap jnode's page, what disk has) is only touched by the
//! atom in PRE_COMMIT, and travels to disk through the overwrite set like
//! any other block

use {
    super::{AllocHint, CommitHookData, SpaceAllocator},
    crate::engine::{
        block::BlockNr,
        cache::{insert_into_table, jload, JNode, JNodeRef, JN_MAPPED},
        error::{Error, RuntimeResult},
        sb::VolumeSuper,
        vdev::BLOCK_SIZE,
    },
    parking_lot::Mutex,
};

/// Bits one bitmap block covers
pub const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;

pub const fn bitmap_blocks_for(block_count: u64) -> u64 {
    (block_count + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK
}

struct BNode {
    index: u64,
    /// commit bitmap content lives in this node's page
    jnode: JNodeRef,
    /// working copy, modified in place
    working: Mutex<Box<[u8]>>,
}

pub struct BitmapAllocator {
    block_count: u64,
    bnodes: Vec<BNode>,
}

#[inline]
fn bit_get(buf: &[u8], bit: u64) -> bool {
    buf[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

#[inline]
fn bit_set(buf: &mut [u8], bit: u64) {
    buf[(bit / 8) as usize] |= 1 << (bit % 8);
}

#[inline]
fn bit_clear(buf: &mut [u8], bit: u64) {
    buf[(bit / 8) as usize] &= !(1 << (bit % 8));
}

impl BitmapAllocator {
    /// Load the on-disk bitmaps through bitmap jnodes and seed the working
    /// copies from them. Returns the allocator and the free-block count it
    /// observed
    pub fn load(sb: &VolumeSuper, block_count: u64) -> RuntimeResult<(Self, u64)> {
        let nr = bitmap_blocks_for(block_count);
        let mut bnodes = Vec::with_capacity(nr as usize);
        let mut free = 0u64;
        for i in 0..nr {
            let j = JNode::new_bitmap(i);
            {
                let mut g = j.guarded();
                g.blocknr = sb.bitmap_block(i);
            }
            j.set_state(JN_MAPPED);
            {
                let _tw = sb.tree().lock_write();
                insert_into_table(sb, &j);
            }
            // pin the data for the lifetime of the mount
            jload(sb, &j)?;
            let commit = j.jdata();
            let working: Box<[u8]> = commit.to_vec().into_boxed_slice();
            let covered = (block_count - i * BITS_PER_BLOCK).min(BITS_PER_BLOCK);
            for bit in 0..covered {
                if !bit_get(&working, bit) {
                    free += 1;
                }
            }
            bnodes.push(BNode {
                index: i,
                jnode: j,
                working: Mutex::new(working),
            });
        }
        Ok((
            Self {
                block_count,
                bnodes,
            },
            free,
        ))
    }
    fn bnode_of(&self, block: u64) -> &BNode {
        &self.bnodes[(block / BITS_PER_BLOCK) as usize]
    }
    /// Longest free run at or after `from` inside one bitmap block
    fn scan_one(&self, bn: &BNode, from: u64, needed: u64) -> Option<(u64, u64)> {
        let base = bn.index * BITS_PER_BLOCK;
        let covered = (self.block_count - base).min(BITS_PER_BLOCK);
        let w = bn.working.lock();
        let mut bit = from.saturating_sub(base).min(covered);
        while bit < covered {
            if bit_get(&w, bit) {
                bit += 1;
                continue;
            }
            let start = bit;
            while bit < covered && bit - start < needed && !bit_get(&w, bit) {
                bit += 1;
            }
            return Some((base + start, bit - start));
        }
        None
    }
    fn mark_run(&self, start: u64, len: u64, used: bool) {
        let mut at = start;
        while at < start + len {
            let bn = self.bnode_of(at);
            let base = bn.index * BITS_PER_BLOCK;
            let mut w = bn.working.lock();
            while at < start + len && at < base + BITS_PER_BLOCK {
                if used {
                    dbg_invariant!(!bit_get(&w, at - base), "double allocation");
                    bit_set(&mut w, at - base);
                } else {
                    dbg_invariant!(bit_get(&w, at - base), "double free");
                    bit_clear(&mut w, at - base);
                }
                at += 1;
            }
        }
    }
}

impl SpaceAllocator for BitmapAllocator {
    fn alloc_blocks(&self, hint: &AllocHint, needed: u64) -> RuntimeResult<(BlockNr, u64)> {
        dbg_invariant!(needed > 0);
        let start_from = hint.preferred.map(|b| b.raw()).unwrap_or(0);
        // forward scan from the hint, wrapping once. the backward policy is
        // accepted but not implemented (see AllocHint)
        let first_bnode = (start_from / BITS_PER_BLOCK) as usize;
        let total = self.bnodes.len();
        for probe in 0..=total {
            let idx = (first_bnode + probe) % total;
            let from = if probe == 0 { start_from } else { 0 };
            if let Some((start, got)) = self.scan_one(&self.bnodes[idx], from, needed) {
                if got == 0 {
                    continue;
                }
                self.mark_run(start, got, true);
                return Ok((BlockNr::new(start), got));
            }
        }
        Err(Error::NoSpace)
    }
    fn dealloc_blocks(&self, start: BlockNr, len: u64) {
        self.mark_run(start.raw(), len, false);
    }
    fn check_blocks(&self, start: BlockNr, len: u64, allocated: bool) -> bool {
        for b in start.raw()..start.raw() + len {
            let bn = self.bnode_of(b);
            let w = bn.working.lock();
            if bit_get(&w, b - bn.index * BITS_PER_BLOCK) != allocated {
                return false;
            }
        }
        true
    }
    fn pre_commit_hook(
        &self,
        sb: &VolumeSuper,
        data: &CommitHookData<'_>,
    ) -> RuntimeResult<Vec<JNodeRef>> {
        let mut touched: Vec<u64> = Vec::new();
        let mut committed_delta = 0i64;
        for (start, len) in data.allocs.iter() {
            for b in start.raw()..start.raw() + len {
                let bn = self.bnode_of(b);
                let page = bn.jnode.jdata_mut();
                let bit = b - bn.index * BITS_PER_BLOCK;
                if !bit_get(page, bit) {
                    bit_set(page, bit);
                    committed_delta -= 1;
                }
                if !touched.contains(&bn.index) {
                    touched.push(bn.index);
                }
            }
        }
        for b in data.deletes.iter() {
            let bn = self.bnode_of(*b);
            let page = bn.jnode.jdata_mut();
            let bit = b - bn.index * BITS_PER_BLOCK;
            if bit_get(page, bit) {
                bit_clear(page, bit);
                committed_delta += 1;
            }
            if !touched.contains(&bn.index) {
                touched.push(bn.index);
            }
        }
        let committed = (sb.space().counters().free_committed as i64 + committed_delta).max(0);
        sb.space().set_free_committed(committed as u64);
        Ok(touched
            .into_iter()
            .map(|i| self.bnodes[i as usize].jnode.clone())
            .collect())
    }
    fn post_commit_hook(&self, _sb: &VolumeSuper, deleted: &[u64]) {
        for b in deleted {
            self.mark_run(*b, 1, false);
        }
    }
    fn post_write_back_hook(&self, _sb: &VolumeSuper, temps: &[(BlockNr, u64)]) {
        for (start, len) in temps {
            self.mark_run(start.raw(), *len, false);
        }
    }
}
