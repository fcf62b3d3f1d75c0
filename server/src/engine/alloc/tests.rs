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

use {
    super::{AllocHint, BlockStage},
    crate::engine::{
        cache::{insert_into_table, JNode},
        config::Tunables,
        sb::{self, MkfsOpts},
        txn::{try_capture, txn_begin, txn_end, CaptureMode, TxnMode},
        vdev::{DeviceRef, MemDevice},
    },
    std::sync::Arc,
};

fn volume() -> Arc<sb::VolumeSuper> {
    let dev: DeviceRef = Arc::new(MemDevice::new(512));
    sb::mkfs(
        &dev,
        MkfsOpts {
            label: None,
            large_keys: false,
        },
    )
    .unwrap();
    sb::mount(dev, Tunables::default()).unwrap()
}

#[test]
fn grab_and_ungrab_move_the_counters() {
    let sup = volume();
    let free0 = sup.space().free_blocks();
    assert!(free0 > 16);
    sup.space().grab_space(&sup, 7, false).unwrap();
    assert_eq!(sup.space().free_blocks(), free0 - 7);
    assert_eq!(sup.space().grabbed_blocks(), 7);
    sup.space().ungrab(7);
    assert_eq!(sup.space().free_blocks(), free0);
    assert_eq!(sup.space().grabbed_blocks(), 0);
}

#[test]
fn overdrawn_grab_is_refused() {
    let sup = volume();
    let free0 = sup.space().free_blocks();
    sup.space().grab_space(&sup, free0 - 3, false).unwrap();
    // 3 left: 5 more cannot be had
    assert!(sup.space().grab_space(&sup, 5, false).is_err());
    // even a forced commit cannot invent blocks on an idle volume
    assert!(sup.space().grab_space(&sup, 5, true).is_err());
    // but what fits still fits
    sup.space().grab_space(&sup, 3, false).unwrap();
    assert_eq!(sup.space().free_blocks(), 0);
    sup.space().ungrab(free0);
}

#[test]
fn grab_retry_succeeds_when_a_forced_commit_frees_blocks() {
    // the other half of the reservation contract: a reservation that does
    // not fit right now must go through once BA_CAN_COMMIT forces a commit
    // whose deferred deallocations free enough blocks
    let sup = volume();
    let free0 = sup.space().free_blocks();
    // two allocated blocks that a pending atom promises to delete
    sup.space().grab_space(&sup, 2, false).unwrap();
    let hint = AllocHint {
        stage: BlockStage::Grabbed,
        ..AllocHint::default()
    };
    let (victims, got) = sup.space().alloc_real(&hint, 2).unwrap();
    assert_eq!(got, 2);
    let txnh = txn_begin(TxnMode::WriteFusing);
    let j = JNode::new_unformatted(77, 0);
    {
        let _tw = sup.tree().lock_write();
        insert_into_table(&sup, &j);
    }
    try_capture(&sup, &txnh, &j, CaptureMode::Write, false).unwrap();
    let atom = txnh.atom().unwrap();
    {
        let mut inner = atom.lock();
        inner.delete_set.insert(victims.raw());
        inner.delete_set.insert(victims.raw() + 1);
    }
    // detach the handle so the forced commit can drain the atom
    txn_end(&sup, &txnh).unwrap();
    // squeeze the pool down to what the commit itself needs
    let squeeze = sup.space().free_blocks() - 4;
    sup.space().grab_space(&sup, squeeze, false).unwrap();
    assert_eq!(sup.space().free_blocks(), 4);
    // 5 do not fit, and without the commit they never will
    assert!(sup.space().grab_space(&sup, 5, false).is_err());
    // with BA_CAN_COMMIT the forced commit applies the delete set and the
    // retried reservation goes through
    sup.space().grab_space(&sup, 5, true).unwrap();
    assert_eq!(sup.space().free_blocks(), 1);
    sup.space().ungrab(squeeze + 5);
    assert_eq!(sup.space().free_blocks(), free0);
}

#[test]
fn alloc_pays_from_the_grabbed_pool() {
    let sup = volume();
    sup.space().grab_space(&sup, 4, false).unwrap();
    let hint = AllocHint {
        stage: BlockStage::Grabbed,
        ..AllocHint::default()
    };
    let (start, got) = sup.space().alloc_real(&hint, 4).unwrap();
    assert_eq!(got, 4);
    assert_eq!(sup.space().grabbed_blocks(), 0);
    assert!(sup.space().check_blocks(start, 4, true));
    // allocations land in the data area, never in the reserved region
    assert!(start.raw() > sb::STATUS_BLOCK);
    sup.space().dealloc_real(start, 4);
    assert!(sup.space().check_blocks(start, 4, false));
}

#[test]
fn fake_allocation_stages() {
    let sup = volume();
    let free0 = sup.space().free_blocks();
    sup.space().grab_space(&sup, 2, false).unwrap();
    sup.space().grabbed2fake(2);
    assert_eq!(sup.space().counters().fake_allocated, 2);
    // one becomes real at "commit", one is discarded
    let hint = AllocHint {
        stage: BlockStage::Unallocated,
        ..AllocHint::default()
    };
    let (start, got) = sup.space().alloc_real(&hint, 1).unwrap();
    assert_eq!(got, 1);
    sup.space().fake2free(1);
    assert_eq!(sup.space().counters().fake_allocated, 0);
    assert_eq!(sup.space().free_blocks(), free0 - 1);
    sup.space().dealloc_real(start, 1);
    assert_eq!(sup.space().free_blocks(), free0);
}

#[test]
fn pre_commit_hook_mirrors_allocs_and_deletes() {
    use {super::CommitHookData, std::collections::BTreeSet};
    let sup = volume();
    let fc0 = sup.space().counters().free_committed;
    sup.space().grab_space(&sup, 2, false).unwrap();
    let hint = AllocHint {
        stage: BlockStage::Grabbed,
        ..AllocHint::default()
    };
    let (start, got) = sup.space().alloc_real(&hint, 2).unwrap();
    assert_eq!(got, 2);
    // delete a block the last commit considered allocated (the reserved
    // area qualifies: mkfs marked it)
    let mut deletes = BTreeSet::new();
    deletes.insert(2u64);
    let touched = sup
        .space()
        .pre_commit_hook(
            &sup,
            &CommitHookData {
                allocs: &[(start, 2)],
                deletes: &deletes,
            },
        )
        .unwrap();
    // one bitmap block covers this whole little volume
    assert_eq!(touched.len(), 1);
    assert_eq!(sup.space().counters().free_committed, fc0 - 2 + 1);
    sup.space().dealloc_real(start, 2);
}

#[test]
fn preferred_hint_is_honored_when_free() {
    let sup = volume();
    sup.space().grab_space(&sup, 1, false).unwrap();
    let probe = crate::engine::block::BlockNr::new(sup.first_data_block() + 40);
    let hint = AllocHint {
        preferred: Some(probe),
        stage: BlockStage::Grabbed,
        ..AllocHint::default()
    };
    let (start, got) = sup.space().alloc_real(&hint, 1).unwrap();
    assert_eq!(got, 1);
    assert_eq!(start, probe);
    sup.space().dealloc_real(start, 1);
}
