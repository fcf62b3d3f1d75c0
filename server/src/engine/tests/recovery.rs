/*
 * Created on Thu Feb 08 2024
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

//! Crash and recovery scenarios: the wandering log must make a commit
//! either fully visible or fully absent, no matter where the world ends

use {
    super::{fresh_volume, remount, sd_key},
    crate::engine::{
        context,
        error::Error,
        tree::{
            edit::{tree_insert, tree_lookup_value},
            item::ITEM_STATDATA,
        },
        txn::{self, debug_crash_after_commit_record, TxnMode},
    },
};

const PAYLOAD: [u8; 16] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    0x10,
];

#[test]
fn clean_commit_survives_remount() {
    let (mem, sup) = fresh_volume(1024);
    {
        let _ctx = context::enter(&sup, TxnMode::WriteFusing);
        let stack = context::current_stack().unwrap();
        tree_insert(&sup, &stack, &sd_key(42), ITEM_STATDATA, &PAYLOAD).unwrap();
    }
    txn::force_commit_all(&sup).unwrap();
    drop(sup);
    let sup = remount(&mem);
    let _ctx = context::enter(&sup, TxnMode::WriteFusing);
    let stack = context::current_stack().unwrap();
    assert_eq!(
        tree_lookup_value(&sup, &stack, &sd_key(42)).unwrap(),
        PAYLOAD.to_vec()
    );
}

#[test]
fn crash_after_commit_record_replays_to_the_same_state() {
    // create object 42, commit, crash after the commit record hits disk but
    // before any write-back. remount must replay the wander map and find
    // the exact payload
    let (mem, sup) = fresh_volume(1024);
    {
        let _ctx = context::enter(&sup, TxnMode::WriteFusing);
        let stack = context::current_stack().unwrap();
        tree_insert(&sup, &stack, &sd_key(42), ITEM_STATDATA, &PAYLOAD).unwrap();
    }
    debug_crash_after_commit_record(true);
    let res = txn::force_commit_all(&sup);
    debug_crash_after_commit_record(false);
    res.unwrap();
    drop(sup);
    let sup = remount(&mem);
    let _ctx = context::enter(&sup, TxnMode::WriteFusing);
    let stack = context::current_stack().unwrap();
    assert_eq!(
        tree_lookup_value(&sup, &stack, &sd_key(42)).unwrap(),
        PAYLOAD.to_vec()
    );
}

#[test]
fn uncommitted_work_is_simply_absent() {
    let (mem, sup) = fresh_volume(1024);
    {
        let _ctx = context::enter(&sup, TxnMode::WriteFusing);
        let stack = context::current_stack().unwrap();
        tree_insert(&sup, &stack, &sd_key(42), ITEM_STATDATA, &PAYLOAD).unwrap();
        // verify it is visible before the "crash"
        assert!(tree_lookup_value(&sup, &stack, &sd_key(42)).is_ok());
    }
    // no commit: drop the world
    drop(sup);
    let sup = remount(&mem);
    let _ctx = context::enter(&sup, TxnMode::WriteFusing);
    let stack = context::current_stack().unwrap();
    assert_eq!(
        tree_lookup_value(&sup, &stack, &sd_key(42)),
        Err(Error::NotFound)
    );
}

#[test]
fn second_crash_replay_is_idempotent() {
    let (mem, sup) = fresh_volume(1024);
    {
        let _ctx = context::enter(&sup, TxnMode::WriteFusing);
        let stack = context::current_stack().unwrap();
        tree_insert(&sup, &stack, &sd_key(7), ITEM_STATDATA, &PAYLOAD).unwrap();
    }
    debug_crash_after_commit_record(true);
    let res = txn::force_commit_all(&sup);
    debug_crash_after_commit_record(false);
    res.unwrap();
    drop(sup);
    // first recovery replays; image again right away (as if we crashed
    // before the footer write of replay could matter) and recover again
    let sup = remount(&mem);
    drop(sup);
    let sup = remount(&mem);
    let _ctx = context::enter(&sup, TxnMode::WriteFusing);
    let stack = context::current_stack().unwrap();
    assert_eq!(
        tree_lookup_value(&sup, &stack, &sd_key(7)).unwrap(),
        PAYLOAD.to_vec()
    );
}
