/*
 * Created on Thu Jan 18 2024
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

//! Long-term reader/writer locks on formatted nodes. These are held across
//! disk i/o and whole traversals, so deadlock cannot be avoided by ordering
//! acquisitions; instead every lock stack runs at one of two priorities:
//!
//! - low (the lookup path): takes locks top-down, right-to-left
//! - high (the balancing path): takes locks bottom-up, left-to-right
//!
//! Whenever a node has high-priority requestors and no high-priority owner,
//! every low-priority owner is *signalled*. A signalled stack fails its next
//! lock attempt with `WouldDeadlock`, releases everything and restarts its
//! operation, which unblocks the balancer

use {
    super::{
        cache::{jref, JNodeRef, JN_DYING, JN_HEARD_BANSHEE},
        error::{Error, RuntimeResult},
        sb::VolumeSuper,
        sync::{ORD_ACQ, ORD_ACR, ORD_REL, ORD_RLX},
        txn,
    },
    core::sync::atomic::{AtomicU32, AtomicU64},
    parking_lot::{Condvar, Mutex},
    std::{collections::VecDeque, sync::Arc},
};

pub mod rank;

/// Cap on how many readers an unlocking writer wakes as one convoy
pub const MAX_CONVOY_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LockRequest {
    pub hipri: bool,
    pub nonblock: bool,
    pub dont_fuse: bool,
}

impl LockRequest {
    pub const LOPRI: Self = Self {
        hipri: false,
        nonblock: false,
        dont_fuse: false,
    };
    pub const HIPRI: Self = Self {
        hipri: true,
        nonblock: false,
        dont_fuse: false,
    };
    pub const fn nonblock(mut self) -> Self {
        self.nonblock = true;
        self
    }
    pub const fn dont_fuse(mut self) -> Self {
        self.dont_fuse = true;
        self
    }
}

/*
    lock stacks
*/

static STACK_IDS: AtomicU64 = AtomicU64::new(1);

struct StackSema {
    count: Mutex<u32>,
    cv: Condvar,
}

/// Per-thread lock state: the set of owned long-term locks, the wakeup
/// semaphore requests sleep on, and the deadlock-signal counter
pub struct LockStack {
    id: u64,
    nr_signaled: AtomicU32,
    sema: StackSema,
    owned: Mutex<Vec<(JNodeRef, LockMode)>>,
}

impl LockStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: STACK_IDS.fetch_add(1, ORD_RLX),
            nr_signaled: AtomicU32::new(0),
            sema: StackSema {
                count: Mutex::new(0),
                cv: Condvar::new(),
            },
            owned: Mutex::new(Vec::new()),
        })
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn is_signaled(&self) -> bool {
        self.nr_signaled.load(ORD_ACQ) > 0
    }
    /// Consume pending signals (the operation is restarting from scratch)
    pub fn reset_signaled(&self) {
        self.nr_signaled.store(0, ORD_REL);
    }
    pub fn signal(&self) {
        self.nr_signaled.fetch_add(1, ORD_ACR);
        self.wake();
    }
    fn wake(&self) {
        let mut c = self.sema.count.lock();
        *c += 1;
        drop(c);
        self.sema.cv.notify_one();
    }
    fn wait(&self) {
        let mut c = self.sema.count.lock();
        while *c == 0 {
            self.sema.cv.wait(&mut c);
        }
        *c -= 1;
    }
    pub fn owned_count(&self) -> usize {
        self.owned.lock().len()
    }
}

/// An owned long-term lock. Consumed by `longterm_unlock_znode`
pub struct LockHandle {
    pub node: JNodeRef,
    pub mode: LockMode,
    pub stack: Arc<LockStack>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("mode", &self.mode)
            .finish()
    }
}

/*
    per-znode lock state
*/

struct OwnerRec {
    stack: Arc<LockStack>,
    mode: LockMode,
    hipri: bool,
    recursion: u32,
}

struct Requestor {
    stack: Arc<LockStack>,
    mode: LockMode,
    hipri: bool,
}

struct ZLockInner {
    owners: Vec<OwnerRec>,
    queue: VecDeque<Requestor>,
    nr_hipri_owners: u32,
    nr_hipri_requests: u32,
    dying: bool,
}

pub struct LongTermLock {
    inner: Mutex<ZLockInner>,
    drain_cv: Condvar,
}

impl LongTermLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ZLockInner {
                owners: Vec::new(),
                queue: VecDeque::new(),
                nr_hipri_owners: 0,
                nr_hipri_requests: 0,
                dying: false,
            }),
            drain_cv: Condvar::new(),
        }
    }
    pub fn nr_owners(&self) -> usize {
        self.inner.lock().owners.len()
    }
    pub fn nr_requests(&self) -> usize {
        self.inner.lock().queue.len()
    }
    pub fn is_write_locked(&self) -> bool {
        let l = self.inner.lock();
        l.owners.iter().any(|o| o.mode == LockMode::Write)
    }
    pub fn is_locked_by(&self, stack: &LockStack) -> Option<LockMode> {
        let l = self.inner.lock();
        l.owners
            .iter()
            .find(|o| o.stack.id == stack.id)
            .map(|o| o.mode)
    }
}

impl ZLockInner {
    fn owner_idx(&self, stack: &LockStack) -> Option<usize> {
        self.owners.iter().position(|o| o.stack.id == stack.id)
    }
    fn has_writer(&self) -> bool {
        self.owners.iter().any(|o| o.mode == LockMode::Write)
    }
    fn compatible(&self, stack: &LockStack, mode: LockMode) -> bool {
        if self.owner_idx(stack).is_some() {
            // recursion is handled before we get here
            return false;
        }
        match mode {
            LockMode::Read => !self.has_writer(),
            LockMode::Write => self.owners.is_empty(),
        }
    }
    /// The deadlock condition: high-priority requests pending with no
    /// high-priority owner. Signal every low-priority owner
    fn check_deadlock(&self) {
        if self.nr_hipri_requests > 0 && self.nr_hipri_owners == 0 {
            for o in self.owners.iter().filter(|o| !o.hipri) {
                o.stack.signal();
            }
        }
    }
    fn enqueued(&self, stack: &LockStack) -> bool {
        self.queue.iter().any(|r| r.stack.id == stack.id)
    }
    fn dequeue(&mut self, stack: &LockStack) -> bool {
        if let Some(pos) = self.queue.iter().position(|r| r.stack.id == stack.id) {
            let r = self.queue.remove(pos).unwrap();
            if r.hipri {
                self.nr_hipri_requests -= 1;
            }
            true
        } else {
            false
        }
    }
    fn grant(&mut self, stack: &Arc<LockStack>, mode: LockMode, hipri: bool) {
        self.owners.push(OwnerRec {
            stack: stack.clone(),
            mode,
            hipri,
            recursion: 0,
        });
        if hipri {
            self.nr_hipri_owners += 1;
            // promotion: a high-priority owner neutralizes pending signals
            // against its own stack
            stack.reset_signaled();
        }
    }
    /// Wake the head of the queue; if the head is a reader, wake a convoy of
    /// compatible readers behind it
    fn wake_requestors(&mut self) {
        let convoy_max = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .clamp(1, MAX_CONVOY_SIZE);
        let mut woken = 0;
        for r in self.queue.iter() {
            if woken == 0 {
                let is_reader = r.mode == LockMode::Read;
                r.stack.wake();
                woken += 1;
                if !is_reader {
                    break;
                }
            } else if r.mode == LockMode::Read && woken < convoy_max {
                r.stack.wake();
                woken += 1;
            } else {
                break;
            }
        }
    }
}

/*
    operations
*/

/// Acquire a long-term lock on `node` for `stack`. The node is captured
/// into the caller's transaction before the lock commits. Returns
/// `WouldDeadlock` for a signalled low-priority stack, `WouldBlock` for a
/// contended non-blocking request and `Dying` for a node being invalidated
pub fn longterm_lock_znode(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    node: &JNodeRef,
    mode: LockMode,
    req: LockRequest,
) -> RuntimeResult<LockHandle> {
    dbg_invariant!(node.is_znode());
    // a node is only lockable while referenced; resurrect a handle for the
    // duration so a cached (x_count == 0) identity is safe to lock
    let hold = match super::cache::jref_lookup(node) {
        Some(h) => h,
        None => return Err(Error::Dying),
    };
    let res = lock_loop(sb, stack, node, mode, req);
    super::cache::jput(sb, &hold);
    res
}

fn lock_loop(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    node: &JNodeRef,
    mode: LockMode,
    req: LockRequest,
) -> RuntimeResult<LockHandle> {
    let lck = &node.z().lck;
    loop {
        // phase 1: compatibility under the node's lock
        {
            let mut l = lck.inner.lock();
            if let Some(idx) = l.owner_idx(stack) {
                // recursive acquisition by the same stack: a write owner
                // satisfies any mode, a read owner satisfies another read
                let ok = match (l.owners[idx].mode, mode) {
                    (LockMode::Write, _) | (LockMode::Read, LockMode::Read) => true,
                    (LockMode::Read, LockMode::Write) => false,
                };
                if ok {
                    l.owners[idx].recursion += 1;
                    l.dequeue(stack);
                    return Ok(LockHandle {
                        node: jref(node),
                        mode,
                        stack: stack.clone(),
                    });
                }
                // read -> write upgrade is not a thing here
                l.dequeue(stack);
                return Err(Error::WouldDeadlock);
            }
            if l.dying || node.test(JN_DYING) || node.test(JN_HEARD_BANSHEE) {
                let dequeued = l.dequeue(stack);
                if dequeued {
                    lck.drain_cv.notify_all();
                }
                return Err(Error::Dying);
            }
            if !req.hipri && stack.is_signaled() {
                let dequeued = l.dequeue(stack);
                if dequeued {
                    lck.drain_cv.notify_all();
                }
                return Err(Error::WouldDeadlock);
            }
            if !l.compatible(stack, mode) {
                if req.nonblock {
                    l.dequeue(stack);
                    return Err(Error::WouldBlock);
                }
                if !l.enqueued(stack) {
                    let r = Requestor {
                        stack: stack.clone(),
                        mode,
                        hipri: req.hipri,
                    };
                    // fairness: high priority to the front, low to the back
                    if req.hipri {
                        l.queue.push_front(r);
                        l.nr_hipri_requests += 1;
                    } else {
                        l.queue.push_back(r);
                    }
                }
                l.check_deadlock();
                drop(l);
                stack.wait();
                continue;
            }
        }
        // phase 2: capture with no short-term lock held (this can sleep on
        // another atom's commit)
        txn::capture_for_lock(sb, node, mode, req.dont_fuse)?;
        // phase 3: recheck and commit
        {
            let mut l = lck.inner.lock();
            if l.dying || node.test(JN_DYING) || node.test(JN_HEARD_BANSHEE) {
                let dequeued = l.dequeue(stack);
                if dequeued {
                    lck.drain_cv.notify_all();
                }
                return Err(Error::Dying);
            }
            if l.compatible(stack, mode) {
                l.dequeue(stack);
                l.grant(stack, mode, req.hipri);
                stack.owned.lock().push((node.clone(), mode));
                return Ok(LockHandle {
                    node: jref(node),
                    mode,
                    stack: stack.clone(),
                });
            }
            // lost the race between capture and commit; go around
        }
    }
}

/// Release an owned lock. Recursion unwinds first; releasing the last
/// ownership wakes requestors
pub fn longterm_unlock_znode(sb: &VolumeSuper, handle: LockHandle) {
    let LockHandle { node, mode, stack } = handle;
    let lck = &node.z().lck;
    let fully_released = {
        let mut l = lck.inner.lock();
        let idx = match l.owner_idx(&stack) {
            Some(idx) => idx,
            None => {
                // ownership already torn down (release_all raced us)
                drop(l);
                super::cache::jput(sb, &node);
                return;
            }
        };
        if l.owners[idx].recursion > 0 {
            l.owners[idx].recursion -= 1;
            false
        } else {
            let rec = l.owners.remove(idx);
            if rec.hipri {
                l.nr_hipri_owners -= 1;
            }
            l.check_deadlock();
            l.wake_requestors();
            true
        }
    };
    if fully_released {
        let mut owned = stack.owned.lock();
        if let Some(pos) = owned
            .iter()
            .position(|(n, m)| Arc::ptr_eq(n, &node) && *m == mode)
        {
            owned.remove(pos);
        }
    }
    super::cache::jput(sb, &node);
}

/// Invalidate a node's lock: the caller must hold WRITE on it. Every
/// pending request is woken and fails with `Dying`; returns when the queue
/// has drained. The write lock itself is consumed
pub fn invalidate_lock(sb: &VolumeSuper, handle: LockHandle) {
    let node = handle.node.clone();
    dbg_invariant!(handle.mode == LockMode::Write);
    node.set_state(JN_DYING);
    {
        let mut l = node.z().lck.inner.lock();
        l.dying = true;
        for r in l.queue.iter() {
            r.stack.wake();
        }
    }
    // drop ownership so requestors can run their (failing) retries
    longterm_unlock_znode(sb, handle);
    let lck = &node.z().lck;
    let mut l = lck.inner.lock();
    while !l.queue.is_empty() {
        // requestors dequeue themselves on the dying path and ping us
        for r in l.queue.iter() {
            r.stack.wake();
        }
        lck.drain_cv.wait_for(&mut l, std::time::Duration::from_millis(1));
    }
}

/// Drop every lock a stack owns, newest first. Used on operation restart
/// after `WouldDeadlock`
pub fn release_all(sb: &VolumeSuper, stack: &Arc<LockStack>) {
    loop {
        let top = {
            let mut owned = stack.owned.lock();
            owned.pop()
        };
        match top {
            Some((node, _)) => {
                let mut refs_held = 0;
                {
                    let mut l = node.z().lck.inner.lock();
                    if let Some(idx) = l.owner_idx(stack) {
                        // recursion is flattened: the whole operation is
                        // being abandoned
                        let rec = l.owners.remove(idx);
                        refs_held = 1 + rec.recursion;
                        if rec.hipri {
                            l.nr_hipri_owners -= 1;
                        }
                        l.check_deadlock();
                        l.wake_requestors();
                    }
                }
                // balance every grant-time jref; the caller must forget its
                // LockHandles after calling this
                for _ in 0..refs_held {
                    super::cache::jput(sb, &node);
                }
            }
            None => break,
        }
    }
}
