/*
 * Created on Sat Jan 20 2024
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

//! The transaction manager. Mutations accumulate in *atoms*: sets of
//! captured node handles plus the bookkeeping needed to either push the
//! whole set to disk atomically or discard it. A thread participates
//! through its transaction handle (one per context); handles bind to at
//! most one atom and atoms merge ("fuse") when their capture sets touch

mod capture;
mod commit;

pub use {
    capture::{
        capture_for_lock, jnode_make_dirty, try_capture, uncapture_jnode, CaptureMode,
    },
    commit::commit_atom,
};
#[cfg(test)]
pub use commit::debug_crash_after_commit_record;

use {
    super::{
        block::BlockNr,
        cache::JNodeRef,
        error::{Error, RuntimeResult},
        sb::VolumeSuper,
        sync::{ORD_ACQ, ORD_RLX},
        znode::MAX_TREE_HEIGHT,
    },
    core::sync::atomic::{AtomicU32, AtomicU64},
    parking_lot::{Condvar, Mutex},
    std::{
        collections::{BTreeMap, BTreeSet},
        sync::Arc,
        time::Instant,
    },
};

/*
    stages
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
/// Atom life stages. Monotone within one atom's lifetime, except the step
/// aside into `Fused` when the atom merges into a larger one
pub enum AtomStage {
    Free = 0,
    /// capturing nodes and fusing freely
    CaptureFuse = 1,
    /// closing down: new handles are refused, fusion from younger atoms is
    /// refused
    CaptureWait = 2,
    PreCommit = 3,
    PostCommit = 4,
    Done = 5,
    /// merged into another atom; terminal for this identity
    Fused = 6,
}

consts! {
    pub ATOM_FORCE_COMMIT: u32 = 1 << 0;
}

/*
    atom
*/

pub struct AtomInner {
    pub stage: AtomStage,
    pub flags: u32,
    pub txnh_count: u32,
    pub capture_count: u32,
    pub nr_objects_created: u32,
    pub nr_objects_deleted: u32,
    pub flush_reserved: u64,
    pub start: Instant,
    /// dirty captured nodes, one list per tree level (level 0 holds
    /// unformatted and non-tree nodes)
    pub dirty: Vec<Vec<JNodeRef>>,
    pub clean: Vec<JNodeRef>,
    pub ovrwr: Vec<JNodeRef>,
    pub writeback: Vec<JNodeRef>,
    pub inodes: Vec<JNodeRef>,
    /// blocks scheduled for deferred deallocation at pre-commit
    pub delete_set: BTreeSet<u64>,
    /// home block -> wandered copy, built by the commit pipeline
    pub wandered: BTreeMap<u64, u64>,
    /// fresh real allocations this commit (start, len), for the bitmap
    /// pre-commit hook
    pub commit_allocs: Vec<(BlockNr, u64)>,
    /// where this atom went if it fused
    pub fused_into: Option<Arc<Atom>>,
}

pub struct Atom {
    id: u64,
    inner: Mutex<AtomInner>,
    /// broadcast on stage changes, fusion and txnh_count drops
    pub stage_cv: Condvar,
}

impl Atom {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(AtomInner {
                stage: AtomStage::CaptureFuse,
                flags: 0,
                txnh_count: 0,
                capture_count: 0,
                nr_objects_created: 0,
                nr_objects_deleted: 0,
                flush_reserved: 0,
                start: Instant::now(),
                dirty: (0..=MAX_TREE_HEIGHT as usize).map(|_| Vec::new()).collect(),
                clean: Vec::new(),
                ovrwr: Vec::new(),
                writeback: Vec::new(),
                inodes: Vec::new(),
                delete_set: BTreeSet::new(),
                wandered: BTreeMap::new(),
                commit_allocs: Vec::new(),
                fused_into: None,
            }),
            stage_cv: Condvar::new(),
        })
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, AtomInner> {
        self.inner.lock()
    }
    pub fn stage(&self) -> AtomStage {
        self.inner.lock().stage
    }
    pub fn capture_count(&self) -> u32 {
        self.inner.lock().capture_count
    }
    pub fn age(&self) -> std::time::Duration {
        self.inner.lock().start.elapsed()
    }
    /// Stage transitions are monotone; fusion is the only sidestep
    pub fn set_stage(&self, next: AtomStage) {
        let mut inner = self.inner.lock();
        dbg_invariant!(
            next >= inner.stage || next == AtomStage::Fused,
            "atom stage went backwards"
        );
        inner.stage = next;
        drop(inner);
        self.stage_cv.notify_all();
    }
    /// Resolve fusion forwarding: the atom a node or handle actually
    /// belongs to now
    pub fn resolve(self: &Arc<Self>) -> Arc<Atom> {
        let mut cur = self.clone();
        loop {
            let next = {
                let inner = cur.inner.lock();
                inner.fused_into.clone()
            };
            match next {
                Some(a) => cur = a,
                None => return cur,
            }
        }
    }
    /// Every dirty node across all levels, leaves first
    pub fn take_all_dirty(inner: &mut AtomInner) -> Vec<JNodeRef> {
        let mut out = Vec::new();
        for lvl in inner.dirty.iter_mut() {
            out.append(lvl);
        }
        out
    }
}

/*
    transaction handles
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    WriteFusing,
    ReadFusing,
}

consts! {
    pub TXNH_WAIT_COMMIT: u32 = 1 << 0;
    pub TXNH_DONT_COMMIT: u32 = 1 << 1;
}

/// A thread's binding to at most one atom
pub struct TxnHandle {
    pub mode: TxnMode,
    pub flags: AtomicU32,
    pub atom: Mutex<Option<Arc<Atom>>>,
}

impl TxnHandle {
    pub fn new(mode: TxnMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            flags: AtomicU32::new(0),
            atom: Mutex::new(None),
        })
    }
    pub fn atom(&self) -> Option<Arc<Atom>> {
        let mut slot = self.atom.lock();
        let resolved = slot.as_ref().map(|a| a.resolve());
        *slot = resolved.clone();
        resolved
    }
    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, ORD_RLX);
    }
    pub fn test_flag(&self, flag: u32) -> bool {
        self.flags.load(ORD_ACQ) & flag != 0
    }
}

/*
    manager
*/

pub struct TxnMgr {
    atoms: Mutex<Vec<Arc<Atom>>>,
    ids: AtomicU64,
    /// one atom commits at a time, system wide
    commit_sema: Mutex<()>,
}

impl TxnMgr {
    pub fn new() -> Self {
        Self {
            atoms: Mutex::new(Vec::new()),
            ids: AtomicU64::new(1),
            commit_sema: Mutex::new(()),
        }
    }
    pub fn new_atom(&self) -> Arc<Atom> {
        let atom = Atom::new(self.ids.fetch_add(1, ORD_RLX));
        self.atoms.lock().push(atom.clone());
        atom
    }
    pub fn commit_sema(&self) -> &Mutex<()> {
        &self.commit_sema
    }
    pub fn atom_count(&self) -> usize {
        self.atoms.lock().len()
    }
    /// Forget an atom that reached `Done` or `Fused`; its id is released
    pub fn retire(&self, atom: &Arc<Atom>) {
        self.atoms.lock().retain(|a| !Arc::ptr_eq(a, atom));
    }
    /// The oldest live atom past `max_age`, or the largest past `max_size`,
    /// if any. What the commit daemon chews on
    pub fn pick_overdue(
        &self,
        max_age: std::time::Duration,
        max_size: u32,
    ) -> Option<Arc<Atom>> {
        let atoms = self.atoms.lock();
        atoms
            .iter()
            .filter(|a| {
                let inner = a.lock();
                matches!(
                    inner.stage,
                    AtomStage::CaptureFuse | AtomStage::CaptureWait
                ) && (inner.start.elapsed() >= max_age
                    || inner.capture_count >= max_size
                    || inner.flags & ATOM_FORCE_COMMIT != 0)
            })
            .min_by_key(|a| a.lock().start)
            .cloned()
    }
    /// Every live atom still capturing
    pub fn live_atoms(&self) -> Vec<Arc<Atom>> {
        self.atoms
            .lock()
            .iter()
            .filter(|a| {
                matches!(
                    a.stage(),
                    AtomStage::CaptureFuse | AtomStage::CaptureWait
                )
            })
            .cloned()
            .collect()
    }
}

/*
    handle open/close
*/

/// Bind a fresh handle into the system (part of context entry)
pub fn txn_begin(mode: TxnMode) -> Arc<TxnHandle> {
    TxnHandle::new(mode)
}

/// Close a handle. Depending on policy this either just detaches or
/// commits the atom right here
pub fn txn_end(sb: &VolumeSuper, txnh: &Arc<TxnHandle>) -> RuntimeResult<()> {
    let atom = {
        let mut slot = txnh.atom.lock();
        slot.take()
    };
    let atom = match atom {
        Some(a) => a.resolve(),
        None => return Ok(()),
    };
    let must_commit = {
        let mut inner = atom.lock();
        dbg_invariant!(inner.txnh_count >= 1);
        inner.txnh_count -= 1;
        let overdue = inner.capture_count >= sb.tunables().atom_max_size
            || inner.start.elapsed() >= sb.tunables().atom_max_age()
            || inner.flags & ATOM_FORCE_COMMIT != 0;
        let wanted = txnh.test_flag(TXNH_WAIT_COMMIT);
        let blocked = txnh.test_flag(TXNH_DONT_COMMIT);
        let go = !blocked && (overdue || wanted);
        drop(inner);
        atom.stage_cv.notify_all();
        go
    };
    if must_commit {
        commit_atom(sb, &atom, true)
    } else {
        Ok(())
    }
}

/// Force every live atom through a commit. Used by `grab_space` when the
/// caller allows a commit to free reserved space, and at unmount
pub fn force_commit_all(sb: &VolumeSuper) -> RuntimeResult<()> {
    let own = super::context::current_txnh().and_then(|t| t.atom());
    for atom in sb.txnmgr().live_atoms() {
        {
            let mut inner = atom.lock();
            if !matches!(
                inner.stage,
                AtomStage::CaptureFuse | AtomStage::CaptureWait
            ) {
                continue;
            }
            inner.flags |= ATOM_FORCE_COMMIT;
        }
        // if our own handle is bound to this atom, the drain floor must
        // account for it or we would wait for ourselves
        let member = own
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(&a.resolve(), &atom.resolve()));
        commit_atom(sb, &atom, member)?;
    }
    Ok(())
}

/// Block until `atom` leaves the capture stages (committed or fused). The
/// caller must not hold short-term locks
pub fn wait_for_atom(atom: &Arc<Atom>) {
    let mut inner = atom.lock();
    while matches!(
        inner.stage,
        AtomStage::CaptureFuse | AtomStage::CaptureWait | AtomStage::PreCommit | AtomStage::PostCommit
    ) {
        atom.stage_cv.wait(&mut inner);
    }
}

/*
    fusion
*/

/// Merge the smaller atom (by capture count) into the larger. Refused once
/// either side is past `CaptureWait`. Returns the surviving atom
pub fn fuse_atoms(
    sb: &VolumeSuper,
    a: &Arc<Atom>,
    b: &Arc<Atom>,
) -> RuntimeResult<Arc<Atom>> {
    let a = a.resolve();
    let b = b.resolve();
    if Arc::ptr_eq(&a, &b) {
        return Ok(a);
    }
    // decide the survivor before locking: larger capture set wins
    let (big, small) = if a.capture_count() >= b.capture_count() {
        (a, b)
    } else {
        (b, a)
    };
    // lock both in address order
    let (first, second) = if Arc::as_ptr(&big) < Arc::as_ptr(&small) {
        (&big, &small)
    } else {
        (&small, &big)
    };
    let mut g1 = first.inner.lock();
    let mut g2 = second.inner.lock();
    {
        let (bg, sg) = if Arc::ptr_eq(first, &big) {
            (&mut g1, &mut g2)
        } else {
            (&mut g2, &mut g1)
        };
        if bg.stage == AtomStage::Fused || sg.stage == AtomStage::Fused {
            // raced another fusion; the caller re-resolves and retries
            return Err(Error::Restart);
        }
        if bg.stage > AtomStage::CaptureWait || sg.stage > AtomStage::CaptureWait {
            return Err(Error::WouldBlock);
        }
        // splice every list and redirect every captured node
        let mut moved: Vec<JNodeRef> = Vec::new();
        for lvl in 0..sg.dirty.len() {
            let drained: Vec<JNodeRef> = sg.dirty[lvl].drain(..).collect();
            for j in drained {
                moved.push(j.clone());
                bg.dirty[lvl].push(j);
            }
        }
        let sg_inner = &mut **sg;
        let clean = &mut sg_inner.clean;
        let ovrwr = &mut sg_inner.ovrwr;
        let writeback = &mut sg_inner.writeback;
        let inodes = &mut sg_inner.inodes;
        let lists = [clean, ovrwr, writeback, inodes];
        for list in lists {
            moved.extend(list.iter().cloned());
        }
        bg.clean.append(&mut sg.clean);
        bg.ovrwr.append(&mut sg.ovrwr);
        bg.writeback.append(&mut sg.writeback);
        bg.inodes.append(&mut sg.inodes);
        for j in moved {
            let mut jg = j.guarded();
            // single-writer: both atom locks are held
            jg.atom = Some(big.clone());
        }
        bg.capture_count += sg.capture_count;
        bg.txnh_count += sg.txnh_count;
        bg.nr_objects_created += sg.nr_objects_created;
        bg.nr_objects_deleted += sg.nr_objects_deleted;
        bg.flush_reserved += sg.flush_reserved;
        bg.flags |= sg.flags;
        // the older birth time drives age-based commit
        if sg.start < bg.start {
            bg.start = sg.start;
        }
        let deletes = core::mem::take(&mut sg.delete_set);
        bg.delete_set.extend(deletes);
        let wandered = core::mem::take(&mut sg.wandered);
        bg.wandered.extend(wandered);
        bg.commit_allocs.append(&mut sg.commit_allocs);
        sg.capture_count = 0;
        sg.txnh_count = 0;
        sg.stage = AtomStage::Fused;
        sg.fused_into = Some(big.clone());
    }
    drop(g1);
    drop(g2);
    small.stage_cv.notify_all();
    big.stage_cv.notify_all();
    sb.txnmgr().retire(&small);
    Ok(big)
}
