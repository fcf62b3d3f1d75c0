/*
 * Created on Wed Feb 07 2024
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

use {
    super::fresh_volume,
    crate::engine::{
        block::BlockNr,
        cache::{jput, jref, JNodeRef},
        error::Error,
        lock::{
            longterm_lock_znode, longterm_unlock_znode, invalidate_lock, LockMode, LockRequest,
            LockStack,
        },
        sb::VolumeSuper,
        znode::zget,
    },
    std::{sync::Arc, thread, time::Duration},
};

fn scratch_znode(sup: &Arc<VolumeSuper>, tag: u64) -> JNodeRef {
    zget(sup, BlockNr::fake_unallocated(90_000 + tag), None, 1).unwrap()
}

fn spin_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("condition never became true");
}

#[test]
fn write_lock_recursion_nests() {
    let (_mem, sup) = fresh_volume(64);
    let n = scratch_znode(&sup, 1);
    let stack = LockStack::new();
    let h1 = longterm_lock_znode(&sup, &stack, &n, LockMode::Write, LockRequest::LOPRI).unwrap();
    // a second write by the same stack must not block
    let h2 = longterm_lock_znode(&sup, &stack, &n, LockMode::Write, LockRequest::LOPRI).unwrap();
    assert_eq!(n.z().lck.nr_owners(), 1);
    longterm_unlock_znode(&sup, h2);
    assert_eq!(n.z().lck.nr_owners(), 1);
    longterm_unlock_znode(&sup, h1);
    assert_eq!(n.z().lck.nr_owners(), 0);
    jput(&sup, &n);
}

#[test]
fn readers_share_writers_exclude() {
    let (_mem, sup) = fresh_volume(64);
    let n = scratch_znode(&sup, 2);
    let s1 = LockStack::new();
    let s2 = LockStack::new();
    let r1 = longterm_lock_znode(&sup, &s1, &n, LockMode::Read, LockRequest::LOPRI).unwrap();
    let r2 = longterm_lock_znode(&sup, &s2, &n, LockMode::Read, LockRequest::LOPRI).unwrap();
    assert_eq!(n.z().lck.nr_owners(), 2);
    // a third stack cannot write right now
    let s3 = LockStack::new();
    assert_eq!(
        longterm_lock_znode(
            &sup,
            &s3,
            &n,
            LockMode::Write,
            LockRequest::LOPRI.nonblock()
        )
        .unwrap_err(),
        Error::WouldBlock
    );
    longterm_unlock_znode(&sup, r1);
    longterm_unlock_znode(&sup, r2);
    jput(&sup, &n);
}

#[test]
fn hipri_request_signals_lopri_owner() {
    // scenario: a low-priority reader holds N; a high-priority writer
    // arrives; the reader's stack must be signalled and its next lock
    // attempt must fail with WouldDeadlock until it backs off
    let (_mem, sup) = fresh_volume(64);
    let n = scratch_znode(&sup, 3);
    let m = scratch_znode(&sup, 4);
    let s1 = LockStack::new();
    let h1 = longterm_lock_znode(&sup, &s1, &n, LockMode::Read, LockRequest::LOPRI).unwrap();
    let sup2 = sup.clone();
    let n2 = jref(&n);
    let t2 = thread::spawn(move || {
        let s2 = LockStack::new();
        let h = longterm_lock_znode(&sup2, &s2, &n2, LockMode::Write, LockRequest::HIPRI)
            .expect("the balancer must win eventually");
        longterm_unlock_znode(&sup2, h);
        jput(&sup2, &n2);
    });
    spin_until(|| n.z().lck.nr_requests() > 0);
    spin_until(|| s1.is_signaled());
    // the signalled stack may not take any new low-priority lock
    assert_eq!(
        longterm_lock_znode(&sup, &s1, &m, LockMode::Read, LockRequest::LOPRI).unwrap_err(),
        Error::WouldDeadlock
    );
    // it backs off: release everything, reset, and the writer proceeds
    longterm_unlock_znode(&sup, h1);
    t2.join().unwrap();
    s1.reset_signaled();
    let h = longterm_lock_znode(&sup, &s1, &m, LockMode::Read, LockRequest::LOPRI).unwrap();
    longterm_unlock_znode(&sup, h);
    jput(&sup, &n);
    jput(&sup, &m);
}

#[test]
fn invalidation_drains_the_queue_with_dying() {
    let (_mem, sup) = fresh_volume(64);
    let n = scratch_znode(&sup, 5);
    let s0 = LockStack::new();
    let h = longterm_lock_znode(&sup, &s0, &n, LockMode::Write, LockRequest::LOPRI).unwrap();
    let mut waiters = Vec::new();
    for _ in 0..2 {
        let sup_t = sup.clone();
        let n_t = jref(&n);
        waiters.push(thread::spawn(move || {
            let s = LockStack::new();
            let res = longterm_lock_znode(&sup_t, &s, &n_t, LockMode::Read, LockRequest::LOPRI);
            jput(&sup_t, &n_t);
            res.map(|h| longterm_unlock_znode(&sup_t, h))
        }));
    }
    spin_until(|| n.z().lck.nr_requests() == 2);
    invalidate_lock(&sup, h);
    for w in waiters {
        assert_eq!(w.join().unwrap().unwrap_err(), Error::Dying);
    }
    assert_eq!(n.z().lck.nr_requests(), 0);
    jput(&sup, &n);
}

#[test]
fn dying_node_refuses_new_requests() {
    let (_mem, sup) = fresh_volume(64);
    let n = scratch_znode(&sup, 6);
    let s0 = LockStack::new();
    let h = longterm_lock_znode(&sup, &s0, &n, LockMode::Write, LockRequest::LOPRI).unwrap();
    invalidate_lock(&sup, h);
    let s1 = LockStack::new();
    assert_eq!(
        longterm_lock_znode(&sup, &s1, &n, LockMode::Read, LockRequest::LOPRI).unwrap_err(),
        Error::Dying
    );
    jput(&sup, &n);
}
