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
        cache::{insert_into_table, JNode, JNodeRef},
        sb::VolumeSuper,
        txn::{try_capture, txn_begin, AtomStage, CaptureMode, TxnMode},
    },
    std::sync::Arc,
};

/// A captured-but-anonymous data block for capture tests
fn scratch_jnode(sup: &Arc<VolumeSuper>, oid: u64, index: u64) -> JNodeRef {
    let j = JNode::new_unformatted(oid, index);
    let _tw = sup.tree().lock_write();
    insert_into_table(sup, &j);
    j
}

#[test]
fn capture_creates_joins_and_fuses() {
    let (_mem, sup) = fresh_volume(256);
    let j = scratch_jnode(&sup, 100, 0);
    let k = scratch_jnode(&sup, 100, 1);
    // t1 captures j: a fresh atom appears
    let t1 = txn_begin(TxnMode::WriteFusing);
    try_capture(&sup, &t1, &j, CaptureMode::Write, false).unwrap();
    let a = t1.atom().unwrap();
    assert_eq!(a.stage(), AtomStage::CaptureFuse);
    assert_eq!(a.capture_count(), 1);
    // t2 has no atom and touches j: it joins a
    let t2 = txn_begin(TxnMode::WriteFusing);
    try_capture(&sup, &t2, &j, CaptureMode::Write, false).unwrap();
    assert!(Arc::ptr_eq(&t2.atom().unwrap(), &a));
    // t3 builds atom b on k, then touches j: b fuses into a
    let t3 = txn_begin(TxnMode::WriteFusing);
    try_capture(&sup, &t3, &k, CaptureMode::Write, false).unwrap();
    let b = t3.atom().unwrap();
    assert!(!Arc::ptr_eq(&b, &a));
    try_capture(&sup, &t3, &j, CaptureMode::Write, false).unwrap();
    assert_eq!(b.stage(), AtomStage::Fused);
    assert!(Arc::ptr_eq(&t3.atom().unwrap(), &a));
    assert_eq!(a.capture_count(), 2);
    // recapturing in the fused world is a no-op
    try_capture(&sup, &t1, &k, CaptureMode::Write, false).unwrap();
    assert_eq!(a.capture_count(), 2);
}

#[test]
fn read_noncom_does_not_capture() {
    let (_mem, sup) = fresh_volume(256);
    let j = scratch_jnode(&sup, 7, 0);
    let t = txn_begin(TxnMode::WriteFusing);
    try_capture(&sup, &t, &j, CaptureMode::ReadNonCom, false).unwrap();
    assert!(t.atom().is_none());
    assert!(j.atom().is_none());
}

#[test]
fn dont_fuse_refuses_cross_atom_capture() {
    let (_mem, sup) = fresh_volume(256);
    let j = scratch_jnode(&sup, 8, 0);
    let k = scratch_jnode(&sup, 8, 1);
    let t1 = txn_begin(TxnMode::WriteFusing);
    let t2 = txn_begin(TxnMode::WriteFusing);
    try_capture(&sup, &t1, &j, CaptureMode::Write, false).unwrap();
    try_capture(&sup, &t2, &k, CaptureMode::Write, false).unwrap();
    assert_eq!(
        try_capture(&sup, &t2, &j, CaptureMode::Write, true),
        Err(crate::engine::error::Error::WouldBlock)
    );
    // both atoms unharmed
    assert_eq!(t1.atom().unwrap().stage(), AtomStage::CaptureFuse);
    assert_eq!(t2.atom().unwrap().stage(), AtomStage::CaptureFuse);
}

#[test]
fn fusion_is_associative() {
    // build (a+b)+c and a+(b+c) in two worlds and compare the survivors
    fn build(
        sup: &Arc<VolumeSuper>,
        order: &str,
    ) -> (u32, Vec<u64>) {
        let t1 = txn_begin(TxnMode::WriteFusing);
        let t2 = txn_begin(TxnMode::WriteFusing);
        let t3 = txn_begin(TxnMode::WriteFusing);
        let j1 = scratch_jnode(sup, 50, 10);
        let j2 = scratch_jnode(sup, 50, 11);
        let j3 = scratch_jnode(sup, 50, 12);
        try_capture(sup, &t1, &j1, CaptureMode::Write, false).unwrap();
        try_capture(sup, &t2, &j2, CaptureMode::Write, false).unwrap();
        try_capture(sup, &t3, &j3, CaptureMode::Write, false).unwrap();
        t1.atom().unwrap().lock().delete_set.insert(1111);
        t2.atom().unwrap().lock().delete_set.insert(2222);
        t3.atom().unwrap().lock().delete_set.insert(3333);
        match order {
            "left" => {
                // (a+b)+c
                try_capture(sup, &t1, &j2, CaptureMode::Write, false).unwrap();
                try_capture(sup, &t1, &j3, CaptureMode::Write, false).unwrap();
            }
            _ => {
                // a+(b+c)
                try_capture(sup, &t2, &j3, CaptureMode::Write, false).unwrap();
                try_capture(sup, &t1, &j2, CaptureMode::Write, false).unwrap();
            }
        }
        let survivor = t1.atom().unwrap();
        assert!(Arc::ptr_eq(&survivor, &t2.atom().unwrap()));
        assert!(Arc::ptr_eq(&survivor, &t3.atom().unwrap()));
        let inner = survivor.lock();
        (
            inner.capture_count,
            inner.delete_set.iter().copied().collect(),
        )
    }
    let (_m1, sup1) = fresh_volume(256);
    let (_m2, sup2) = fresh_volume(256);
    let left = build(&sup1, "left");
    let right = build(&sup2, "right");
    assert_eq!(left, right);
    assert_eq!(left.0, 3);
    assert_eq!(left.1, vec![1111, 2222, 3333]);
}

#[test]
fn empty_atom_commits_and_releases_its_id() {
    let (_mem, sup) = fresh_volume(256);
    let atom = sup.txnmgr().new_atom();
    let before = sup.txnmgr().atom_count();
    crate::engine::txn::commit_atom(&sup, &atom, false).unwrap();
    assert_eq!(atom.stage(), AtomStage::Done);
    assert_eq!(sup.txnmgr().atom_count(), before - 1);
}
