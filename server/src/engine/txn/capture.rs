/*
 * Created on Sun Jan 21 2024
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

//! Capture: the act of associating a node handle with the calling thread's
//! atom. Every path that modifies a node captures it first; reads capture
//! only when the handle wants snapshot semantics. When a node already
//! belongs to somebody else's atom the two atoms fuse (unless the caller
//! opted out), which is what gives overlapping transactions one commit
//! point

use {
    super::{fuse_atoms, wait_for_atom, Atom, AtomStage, TxnMode},
    crate::engine::{
        cache::{JNodeRef, JType, JN_DIRTY, JN_FLUSH_QUEUED, JN_OVRWR, JN_RELOC},
        context,
        error::{Error, RuntimeResult},
        lock::LockMode,
        sb::VolumeSuper,
        vdev::page::PG_DIRTY,
    },
    std::sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a thread wants to relate to a node it touches
pub enum CaptureMode {
    /// snapshot read: joins/fuses so the read sees one commit boundary
    ReadAtomic,
    /// non-communicating read: no capture at all
    ReadNonCom,
    /// read that will soon be a write
    ReadModify,
    Write,
}

impl CaptureMode {
    pub const fn fuses(&self) -> bool {
        !matches!(self, CaptureMode::ReadNonCom)
    }
}

/// Associate `node` with the calling handle's atom, fusing or waiting as
/// needed. This can sleep while some other atom finishes committing, so no
/// short-term locks may be held on entry
pub fn try_capture(
    sb: &VolumeSuper,
    txnh: &Arc<super::TxnHandle>,
    node: &JNodeRef,
    mode: CaptureMode,
    dont_fuse: bool,
) -> RuntimeResult<()> {
    if !mode.fuses() {
        return Ok(());
    }
    loop {
        let natom = node.atom();
        let hatom = txnh.atom();
        match (natom, hatom) {
            (Some(na), Some(ha)) => {
                let na = na.resolve();
                if Arc::ptr_eq(&na, &ha) {
                    return Ok(());
                }
                if dont_fuse {
                    return Err(Error::WouldBlock);
                }
                match fuse_atoms(sb, &na, &ha) {
                    Ok(survivor) => {
                        *txnh.atom.lock() = Some(survivor);
                        return Ok(());
                    }
                    // a side is committing: wait it out, the node frees up
                    Err(Error::WouldBlock) => wait_for_atom(&na),
                    // fusion raced another fusion; just retry
                    Err(Error::Restart) => {}
                    Err(e) => return Err(e),
                }
            }
            (Some(na), None) => {
                let na = na.resolve();
                let joined = {
                    let mut inner = na.lock();
                    if inner.stage == AtomStage::CaptureFuse {
                        inner.txnh_count += 1;
                        true
                    } else {
                        false
                    }
                };
                if joined {
                    *txnh.atom.lock() = Some(na);
                    return Ok(());
                }
                // closing or committing: new handles are refused
                wait_for_atom(&na);
            }
            (None, Some(ha)) => match ha.stage() {
                AtomStage::Done => {
                    // our old atom finished without us noticing; detach and
                    // start fresh
                    *txnh.atom.lock() = None;
                }
                AtomStage::Fused => {
                    let _ = txnh.atom();
                }
                AtomStage::PreCommit | AtomStage::PostCommit => {
                    // our own atom is committing underneath us
                    wait_for_atom(&ha);
                    *txnh.atom.lock() = None;
                }
                _ => {
                    if capture_assign(&ha, node) {
                        return Ok(());
                    }
                }
            },
            (None, None) => {
                let atom = sb.txnmgr().new_atom();
                atom.lock().txnh_count = 1;
                *txnh.atom.lock() = Some(atom.clone());
                if capture_assign(&atom, node) {
                    return Ok(());
                }
            }
        }
    }
}

/// Put a free node into `atom`'s clean list. Returns false if somebody
/// captured it first (caller retries)
fn capture_assign(atom: &Arc<Atom>, node: &JNodeRef) -> bool {
    let mut inner = atom.lock();
    let mut g = node.guarded();
    if g.atom.is_some() {
        return false;
    }
    g.atom = Some(atom.clone());
    drop(g);
    inner.capture_count += 1;
    if node.jtype() == JType::Inode {
        inner.inodes.push(node.clone());
    } else {
        inner.clean.push(node.clone());
    }
    true
}

/// The capture the lock manager performs before committing a long-term
/// lock. Read locks capture per the handle's fusing mode; write locks
/// always capture for write. Outside any context (mount paths) this is a
/// no-op
pub fn capture_for_lock(
    sb: &VolumeSuper,
    node: &JNodeRef,
    mode: LockMode,
    dont_fuse: bool,
) -> RuntimeResult<()> {
    let txnh = match context::current_txnh() {
        Some(t) => t,
        None => return Ok(()),
    };
    let cap = match mode {
        LockMode::Write => CaptureMode::Write,
        LockMode::Read => match txnh.mode {
            TxnMode::ReadFusing => CaptureMode::ReadAtomic,
            TxnMode::WriteFusing => CaptureMode::ReadNonCom,
        },
    };
    try_capture(sb, &txnh, node, cap, dont_fuse)
}

/*
    dirtying
*/

/// Mark a captured node dirty and move it to its level's dirty list. The
/// node must already be captured (dirty implies an owning atom)
pub fn jnode_make_dirty(_sb: &VolumeSuper, node: &JNodeRef) {
    let atom = match node.atom() {
        Some(a) => a.resolve(),
        None => {
            dbg_invariant!(false, "dirtying an uncaptured node");
            return;
        }
    };
    let mut inner = atom.lock();
    if node.test(JN_DIRTY) {
        return;
    }
    node.set_state(JN_DIRTY);
    let level = if node.is_znode() {
        node.z().level() as usize
    } else {
        0
    };
    if let Some(pos) = inner.clean.iter().position(|j| Arc::ptr_eq(j, node)) {
        inner.clean.swap_remove(pos);
    }
    inner.dirty[level].push(node.clone());
    if let Some(pg) = node.page() {
        pg.set(PG_DIRTY);
    }
}

/// Detach a node from its atom, clearing commit state. Used on abort and
/// after write-back
pub fn uncapture_jnode(_sb: &VolumeSuper, atom: &Arc<Atom>, node: &JNodeRef) {
    let mut inner = atom.lock();
    {
        let mut g = node.guarded();
        match &g.atom {
            Some(a) if Arc::ptr_eq(&a.resolve(), &atom.resolve()) => {
                g.atom = None;
            }
            _ => return,
        }
    }
    let inner = &mut *inner;
    let clean = &mut inner.clean;
    let ovrwr = &mut inner.ovrwr;
    let writeback = &mut inner.writeback;
    let inodes = &mut inner.inodes;
    let other_lists = [clean, ovrwr, writeback, inodes];
    let dirty = &mut inner.dirty;
    for list in dirty.iter_mut().chain(other_lists) {
        if let Some(pos) = list.iter().position(|j| Arc::ptr_eq(j, node)) {
            list.swap_remove(pos);
        }
    }
    inner.capture_count = inner.capture_count.saturating_sub(1);
    node.clear_state(JN_DIRTY | JN_RELOC | JN_OVRWR | JN_FLUSH_QUEUED);
    if let Some(pg) = node.page() {
        pg.clear(PG_DIRTY);
    }
}
