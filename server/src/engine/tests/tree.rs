/*
 * Created on Tue Feb 06 2024
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
    super::{body_key, fresh_volume, sd_key},
    crate::engine::{
        context,
        error::Error,
        lock::LockMode,
        tree::{
            edit::{tree_insert, tree_lookup_value, tree_remove},
            item::{extent_encode, ITEM_EXTENT, ITEM_STATDATA},
            node::{Bias, NodeOps, LAYOUT40},
            search::{cbk_put, coord_by_key, CbkOutcome, CBK_UNIQUE},
        },
        txn::{jnode_make_dirty, TxnMode},
        vdev::BLOCK_SIZE,
        znode::{znode_get_ld_key, znode_set_dk, LEAF_LEVEL, TWIG_LEVEL},
    },
    crate::engine::block::BlockNr,
};

#[test]
fn insert_find_remove() {
    let (_mem, sup) = fresh_volume(1024);
    let _ctx = context::enter(&sup, TxnMode::WriteFusing);
    let stack = context::current_stack().unwrap();
    let key = sd_key(42);
    let payload: Vec<u8> = (0x01..=0x10).collect();
    tree_insert(&sup, &stack, &key, ITEM_STATDATA, &payload).unwrap();
    assert_eq!(tree_lookup_value(&sup, &stack, &key).unwrap(), payload);
    // duplicate insertion is refused
    assert_eq!(
        tree_insert(&sup, &stack, &key, ITEM_STATDATA, &payload),
        Err(Error::Exists)
    );
    tree_remove(&sup, &stack, &key).unwrap();
    assert_eq!(
        tree_lookup_value(&sup, &stack, &key),
        Err(Error::NotFound)
    );
    assert_eq!(tree_remove(&sup, &stack, &key), Err(Error::NotFound));
}

#[test]
fn inserts_split_nodes_and_grow_the_tree() {
    let (_mem, sup) = fresh_volume(2048);
    let _ctx = context::enter(&sup, TxnMode::WriteFusing);
    let stack = context::current_stack().unwrap();
    let payload = [0xabu8; 96];
    // enough to overflow several leaves
    for oid in 0..400u64 {
        tree_insert(&sup, &stack, &sd_key(oid), ITEM_STATDATA, &payload).unwrap();
    }
    assert!(sup.tree().height() >= 2, "the tree should have grown");
    for oid in 0..400u64 {
        assert_eq!(
            tree_lookup_value(&sup, &stack, &sd_key(oid)).unwrap(),
            payload.to_vec(),
            "oid {oid} lost after splits"
        );
    }
    // and everything survives a commit
    crate::engine::txn::force_commit_all(&sup).unwrap();
    for oid in (0..400u64).step_by(17) {
        assert_eq!(
            tree_lookup_value(&sup, &stack, &sd_key(oid)).unwrap(),
            payload.to_vec()
        );
    }
}

#[test]
fn lookup_cache_serves_repeat_searches() {
    let (_mem, sup) = fresh_volume(1024);
    let _ctx = context::enter(&sup, TxnMode::WriteFusing);
    let stack = context::current_stack().unwrap();
    for oid in 0..32u64 {
        tree_insert(&sup, &stack, &sd_key(oid), ITEM_STATDATA, &[1, 2, 3]).unwrap();
    }
    assert!(sup.tree().cbk().len() > 0);
    // repeat lookups keep hitting (and bumping) the cache
    for _ in 0..3 {
        for oid in [3u64, 17, 30] {
            assert!(tree_lookup_value(&sup, &stack, &sd_key(oid)).is_ok());
        }
    }
}

#[test]
fn extent_at_twig_ends_the_tree_early() {
    // a hand-built twig extent: the tree ends there for that key range, so
    // a search asked to reach the leaf level must stop at the twig
    let (_mem, sup) = fresh_volume(2048);
    let _ctx = context::enter(&sup, TxnMode::WriteFusing);
    let stack = context::current_stack().unwrap();
    let payload = [0x2au8; 96];
    for oid in 0..300u64 {
        tree_insert(&sup, &stack, &sd_key(oid), ITEM_STATDATA, &payload).unwrap();
    }
    assert!(sup.tree().height() >= TWIG_LEVEL);
    // everything from the extent's key onward belongs to the extent, not to
    // the rightmost leaf: trim that leaf's right delimiting key first
    let ek = body_key(1000, 0);
    {
        let lres = coord_by_key(
            &sup,
            &stack,
            &ek,
            LockMode::Read,
            Bias::MaxNotMoreThan,
            LEAF_LEVEL,
            LEAF_LEVEL,
            CBK_UNIQUE,
        )
        .unwrap();
        assert_eq!(lres.outcome, CbkOutcome::NotFound);
        let lnode = lres.coord.node.clone();
        assert_eq!(lnode.z().level(), LEAF_LEVEL);
        {
            let _dk = sup.tree().dk_guard();
            let ld = znode_get_ld_key(&lnode);
            znode_set_dk(&lnode, ld, ek);
        }
        cbk_put(&sup, lres);
    }
    // append one extent of 50 blocks to the twig by hand, past every
    // downlink
    let body = extent_encode(&[(BlockNr::new(100), 50)]);
    {
        let res = coord_by_key(
            &sup,
            &stack,
            &ek,
            LockMode::Write,
            Bias::MaxNotMoreThan,
            TWIG_LEVEL,
            TWIG_LEVEL,
            CBK_UNIQUE,
        )
        .unwrap();
        assert_eq!(res.outcome, CbkOutcome::NotFound);
        let node = res.coord.node.clone();
        assert_eq!(node.z().level(), TWIG_LEVEL);
        jnode_make_dirty(&sup, &node);
        let pos = res.coord.item_pos as usize + 1;
        LAYOUT40
            .insert_item(node.jdata_mut(), pos, &ek, ITEM_EXTENT, &body, false)
            .unwrap();
        node.z().bump_version(sup.tree().next_version());
        cbk_put(&sup, res);
    }
    // a covered offset: the leaf-bound search bottoms out at the twig, on
    // the extent unit
    let probe = body_key(1000, 30 * BLOCK_SIZE as u64);
    let res = coord_by_key(
        &sup,
        &stack,
        &probe,
        LockMode::Read,
        Bias::MaxNotMoreThan,
        LEAF_LEVEL,
        LEAF_LEVEL,
        CBK_UNIQUE,
    )
    .unwrap();
    assert_eq!(res.outcome, CbkOutcome::Found);
    // the stop level asked for the leaf; the coord still sits on the twig
    assert_eq!(res.coord.node.z().level(), TWIG_LEVEL);
    assert_eq!(res.coord.unit_pos, 0);
    assert_eq!(res.coord.between, crate::engine::tree::Between::AtUnit);
    cbk_put(&sup, res);
    // an offset beyond the extent: still the twig, positioned after the
    // last unit
    let probe = body_key(1000, 200 * BLOCK_SIZE as u64);
    let res = coord_by_key(
        &sup,
        &stack,
        &probe,
        LockMode::Read,
        Bias::MaxNotMoreThan,
        LEAF_LEVEL,
        LEAF_LEVEL,
        CBK_UNIQUE,
    )
    .unwrap();
    assert_eq!(res.outcome, CbkOutcome::NotFound);
    assert_eq!(res.coord.node.z().level(), TWIG_LEVEL);
    assert_eq!(
        res.coord.between,
        crate::engine::tree::Between::AfterUnit
    );
    cbk_put(&sup, res);
}

#[test]
fn twig_stop_level_search() {
    let (_mem, sup) = fresh_volume(2048);
    let _ctx = context::enter(&sup, TxnMode::WriteFusing);
    let stack = context::current_stack().unwrap();
    let payload = [0x55u8; 128];
    for oid in 0..300u64 {
        tree_insert(&sup, &stack, &sd_key(oid), ITEM_STATDATA, &payload).unwrap();
    }
    assert!(sup.tree().height() >= TWIG_LEVEL);
    // stopping at the twig yields a twig coord, not a leaf one
    let res = coord_by_key(
        &sup,
        &stack,
        &sd_key(150),
        LockMode::Read,
        Bias::MaxNotMoreThan,
        TWIG_LEVEL,
        TWIG_LEVEL,
        CBK_UNIQUE,
    )
    .unwrap();
    assert_eq!(res.coord.node.z().level(), TWIG_LEVEL);
    cbk_put(&sup, res);
}

#[test]
fn seal_validates_until_the_node_changes() {
    use crate::engine::tree::seal::{seal_init, seal_validate};
    let (_mem, sup) = fresh_volume(1024);
    let _ctx = context::enter(&sup, TxnMode::WriteFusing);
    let stack = context::current_stack().unwrap();
    tree_insert(&sup, &stack, &sd_key(1), ITEM_STATDATA, &[9u8; 8]).unwrap();
    let res = coord_by_key(
        &sup,
        &stack,
        &sd_key(1),
        LockMode::Read,
        Bias::Exact,
        LEAF_LEVEL,
        LEAF_LEVEL,
        CBK_UNIQUE,
    )
    .unwrap();
    let seal = seal_init(&res.coord);
    let coord = res.coord.clone();
    cbk_put(&sup, res);
    // untouched node: the seal revalidates
    let h = seal_validate(&sup, &stack, &seal, &coord, LockMode::Read).unwrap();
    crate::engine::lock::longterm_unlock_znode(&sup, h);
    // edit the node: the seal breaks
    tree_insert(&sup, &stack, &sd_key(2), ITEM_STATDATA, &[9u8; 8]).unwrap();
    assert_eq!(
        seal_validate(&sup, &stack, &seal, &coord, LockMode::Read).unwrap_err(),
        Error::Restart
    );
}
