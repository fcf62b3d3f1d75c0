/*
 * Created on Mon Jan 29 2024
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

//! Structure changes: item insertion and removal, node splits, root
//! growth, downlink maintenance. Splits walk upward in the balancing
//! direction (high priority, left-to-right), which is what the lock
//! protocol's H class exists for

use {
    super::{
        item::{internal_child, internal_encode, internal_set_child, ITEM_INTERNAL},
        node::{Bias, NodeOps, LAYOUT40},
        search::{cbk_put, coord_by_key, CbkOutcome, CBK_UNIQUE},
        Between, Coord,
    },
    crate::engine::{
        cache::{jload, jput, jrelse, JNodeRef, JN_CREATED},
        error::{Error, RuntimeResult},
        key::{Key, MIN_KEY},
        lock::{
            invalidate_lock, longterm_lock_znode, longterm_unlock_znode, LockHandle, LockMode,
            LockRequest, LockStack,
        },
        sb::VolumeSuper,
        txn::jnode_make_dirty,
        znode::{
            link_siblings, update_boundary_key, zget, znode_get_rd_key, znode_is_uber,
            znode_parent_coord, znode_right, znode_set_banshee, znode_set_dk, znode_set_parent,
            zrelse, TreeLevel, LEAF_LEVEL,
        },
    },
    std::sync::Arc,
};

/*
    public surface
*/

/// Insert an item. Fails with `Exists` when the key is taken
pub fn tree_insert(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    key: &Key,
    plugin: u16,
    body: &[u8],
) -> RuntimeResult<()> {
    sb.check_writable()?;
    // worst case one fresh node per level plus a root growth
    let reserve = sb.tree().height() as u64 + 2;
    sb.space().grab_space(sb, reserve, true)?;
    let res = insert_reserved(sb, stack, key, plugin, body);
    // whatever the split path consumed already left GRABBED; settle the rest
    sb.space().all_grabbed2free();
    res
}

fn insert_reserved(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    key: &Key,
    plugin: u16,
    body: &[u8],
) -> RuntimeResult<()> {
    let large = sb.large_keys();
    let res = coord_by_key(
        sb,
        stack,
        key,
        LockMode::Write,
        Bias::Exact,
        LEAF_LEVEL,
        LEAF_LEVEL,
        CBK_UNIQUE,
    )?;
    if res.outcome == CbkOutcome::Found {
        cbk_put(sb, res);
        return Err(Error::Exists);
    }
    let needed = body.len() + LAYOUT40.overhead(large);
    let (coord, lock) = if LAYOUT40.free_space(res.coord.node.jdata(), large) < needed {
        let c = res.coord.clone();
        make_space(sb, stack, c, res.lock, key, needed)?
    } else {
        (res.coord, res.lock)
    };
    let node = coord.node.clone();
    jnode_make_dirty(sb, &node);
    let pos = insert_pos(&coord);
    if let Err(e) = LAYOUT40.insert_item(node.jdata_mut(), pos, key, plugin, body, large) {
        zrelse(&node);
        longterm_unlock_znode(sb, lock);
        return Err(e);
    }
    node.z().bump_version(sb.tree().next_version());
    if node.z().level() > LEAF_LEVEL {
        fix_children_from(sb, &node, pos + 1);
    }
    sb.tree().cbk().bump(&node);
    zrelse(&node);
    longterm_unlock_znode(sb, lock);
    Ok(())
}

/// Remove the item at `key`. Empty non-root nodes are killed on the way
/// out and their blocks deferred-deallocated
pub fn tree_remove(sb: &VolumeSuper, stack: &Arc<LockStack>, key: &Key) -> RuntimeResult<()> {
    sb.check_writable()?;
    let large = sb.large_keys();
    let res = coord_by_key(
        sb,
        stack,
        key,
        LockMode::Write,
        Bias::Exact,
        LEAF_LEVEL,
        LEAF_LEVEL,
        CBK_UNIQUE,
    )?;
    if res.outcome != CbkOutcome::Found {
        cbk_put(sb, res);
        return Err(Error::NotFound);
    }
    let node = res.coord.node.clone();
    let pos = res.coord.item_pos as usize;
    jnode_make_dirty(sb, &node);
    LAYOUT40.remove_item(node.jdata_mut(), pos, large);
    node.z().bump_version(sb.tree().next_version());
    if node.z().level() > LEAF_LEVEL {
        fix_children_from(sb, &node, pos);
    }
    let emptied = LAYOUT40.num_items(node.jdata()) == 0;
    let is_root = {
        let _tr = sb.tree().lock_read();
        znode_parent_coord(&node)
            .map(|(p, _)| znode_is_uber(&p))
            .unwrap_or(true)
    };
    if emptied && !is_root {
        kill_node(sb, stack, res.lock)
    } else {
        zrelse(&node);
        longterm_unlock_znode(sb, res.lock);
        Ok(())
    }
}

/// Copy out the item body found at `key`, if any
pub fn tree_lookup_value(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    key: &Key,
) -> RuntimeResult<Vec<u8>> {
    let res = coord_by_key(
        sb,
        stack,
        key,
        LockMode::Read,
        Bias::Exact,
        LEAF_LEVEL,
        LEAF_LEVEL,
        CBK_UNIQUE,
    )?;
    let out = if res.outcome == CbkOutcome::Found {
        Ok(LAYOUT40
            .item_body(res.coord.node.jdata(), res.coord.item_pos as usize, sb.large_keys())
            .to_vec())
    } else {
        Err(Error::NotFound)
    };
    cbk_put(sb, res);
    out
}

/*
    node creation
*/

/// Fresh formatted node at a fake address: created, captured, write-locked
/// high priority, dirty. One unit of GRABBED space moves to UNALLOCATED
pub fn new_znode(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    level: TreeLevel,
) -> RuntimeResult<(JNodeRef, LockHandle)> {
    sb.space().grabbed2fake(1);
    let blk = sb.next_fake_block();
    let j = zget(sb, blk, None, level)?;
    j.set_state(JN_CREATED);
    let lh = match longterm_lock_znode(sb, stack, &j, LockMode::Write, LockRequest::HIPRI) {
        Ok(l) => l,
        Err(e) => {
            jput(sb, &j);
            return Err(e);
        }
    };
    zinit_new(sb, &j, level)?;
    jnode_make_dirty(sb, &j);
    jput(sb, &j);
    Ok((lh.node.clone(), lh))
}

/// Format a fresh node's page. Leaves the data pinned for the caller
pub fn zinit_new(sb: &VolumeSuper, j: &JNodeRef, level: TreeLevel) -> RuntimeResult<()> {
    jload(sb, j)?;
    LAYOUT40.init(j.jdata_mut(), level, sb.large_keys());
    j.z().set_nplug(LAYOUT40.id());
    Ok(())
}

/*
    splits
*/

fn insert_pos(coord: &Coord) -> usize {
    match coord.between {
        Between::EmptyNode | Between::BeforeItem | Between::BeforeUnit => 0,
        Between::AtUnit | Between::AfterUnit | Between::AfterItem => coord.item_pos as usize + 1,
        Between::Invalid => unreachable!(),
    }
}

/// Make room for `needed` bytes at `coord` by splitting the node. Returns
/// the (possibly relocated) coord and the lock covering it; the other
/// side's lock is released
fn make_space(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    coord: Coord,
    lock: LockHandle,
    key: &Key,
    needed: usize,
) -> RuntimeResult<(Coord, LockHandle)> {
    let large = sb.large_keys();
    let node = coord.node.clone();
    let level = node.z().level();
    let all = LAYOUT40.drain_items(node.jdata(), large);
    let n = all.len();
    if n == 0 {
        // an empty node that still cannot fit the item: the item itself is
        // oversized
        zrelse(&node);
        longterm_unlock_znode(sb, lock);
        return Err(Error::NoSpace);
    }
    let ins = insert_pos(&coord);
    let (right_j, right_lock) = match new_znode(sb, stack, level) {
        Ok(r) => r,
        Err(e) => {
            zrelse(&node);
            longterm_unlock_znode(sb, lock);
            return Err(e);
        }
    };
    // items at and after the insertion point move right; the new item
    // lands at the end of the left node or the head of the right one
    let at = ins.min(n);
    jnode_make_dirty(sb, &node);
    LAYOUT40.init(node.jdata_mut(), level, large);
    for (i, (k, p, b)) in all[..at].iter().enumerate() {
        LAYOUT40
            .insert_item(node.jdata_mut(), i, k, *p, b, large)
            .unwrap();
    }
    for (i, (k, p, b)) in all[at..].iter().enumerate() {
        LAYOUT40
            .insert_item(right_j.jdata_mut(), i, k, *p, b, large)
            .unwrap();
    }
    node.z().bump_version(sb.tree().next_version());
    right_j.z().bump_version(sb.tree().next_version());
    // the split boundary: the first key on the right, or the new key when
    // everything stayed left
    let boundary = if at < n { all[at].0 } else { *key };
    let old_right = {
        let _tr = sb.tree().lock_read();
        znode_right(&node)
    };
    {
        let _tw = sb.tree().lock_write();
        let _dk = sb.tree().dk_guard();
        let old_rd = znode_get_rd_key(&node);
        znode_set_dk(&right_j, boundary, old_rd);
        update_boundary_key(&node, &right_j, boundary);
        if let Some(r) = &old_right {
            link_siblings(&right_j, r);
        }
        link_siblings(&node, &right_j);
    }
    if let Some(r) = old_right {
        jput(sb, &r);
    }
    if level > LEAF_LEVEL {
        fix_children_from(sb, &node, 0);
        fix_children_from(sb, &right_j, 0);
    }
    // hook the new node into the parent (may split upward / grow the root).
    // space was reserved up front, so a failure here means the split can no
    // longer be completed and the in-memory tree is not trustworthy
    if let Err(e) = insert_downlink(sb, stack, &node, &right_j, boundary) {
        log::error!("tree: split of {} lost its downlink: {}", node.blocknr(), e);
        zrelse(&node);
        longterm_unlock_znode(sb, lock);
        zrelse(&right_j);
        longterm_unlock_znode(sb, right_lock);
        sb.demote_readonly(Error::Corrupt);
        return Err(Error::Io(std::io::ErrorKind::Other));
    }
    // where does the caller's item go now?
    let left_fits = LAYOUT40.free_space(node.jdata(), large) >= needed;
    if at == ins && !left_fits {
        // the item belongs at the boundary; the right node starts with the
        // moved tail (or is empty), either way position 0 is correct
        zrelse(&node);
        longterm_unlock_znode(sb, lock);
        let between = if LAYOUT40.num_items(right_j.jdata()) == 0 {
            Between::EmptyNode
        } else {
            Between::BeforeItem
        };
        let coord = Coord {
            node: right_j,
            item_pos: 0,
            unit_pos: 0,
            between,
        };
        return Ok((coord, right_lock));
    }
    // the left node took the space back
    zrelse(&right_j);
    longterm_unlock_znode(sb, right_lock);
    let between = if LAYOUT40.num_items(node.jdata()) == 0 {
        Between::EmptyNode
    } else if ins == 0 {
        Between::BeforeItem
    } else {
        Between::AfterItem
    };
    let coord = Coord {
        node,
        item_pos: ins.saturating_sub(1) as u16,
        unit_pos: 0,
        between,
    };
    Ok((coord, lock))
}

/// Post a downlink for `right` (split off `left` at `boundary`) into the
/// parent, splitting upward as needed
fn insert_downlink(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    left: &JNodeRef,
    right: &JNodeRef,
    boundary: Key,
) -> RuntimeResult<()> {
    let large = sb.large_keys();
    let (parent, pos) = {
        let _tr = sb.tree().lock_read();
        match znode_parent_coord(left) {
            Some(pc) => pc,
            None => return Err(Error::Restart),
        }
    };
    if znode_is_uber(&parent) {
        return grow_root(sb, stack, left, right, boundary);
    }
    let ph = longterm_lock_znode(sb, stack, &parent, LockMode::Write, LockRequest::HIPRI)?;
    let pnode = ph.node.clone();
    jload(sb, &pnode)?;
    jnode_make_dirty(sb, &pnode);
    let needed = super::item::INTERNAL_BODY_SIZE + LAYOUT40.overhead(large);
    let (pcoord, plock) = if LAYOUT40.free_space(pnode.jdata(), large) < needed {
        let coord = Coord {
            node: pnode.clone(),
            item_pos: pos,
            unit_pos: 0,
            between: Between::AfterItem,
        };
        make_space(sb, stack, coord, ph, &boundary, needed)?
    } else {
        (
            Coord {
                node: pnode.clone(),
                item_pos: pos,
                unit_pos: 0,
                between: Between::AfterItem,
            },
            ph,
        )
    };
    // pcoord names where a `boundary`-keyed item belongs, whichever half of
    // a split parent that ended up being
    let target = pcoord.node.clone();
    let ins = insert_pos(&pcoord);
    jnode_make_dirty(sb, &target);
    LAYOUT40.insert_item(
        target.jdata_mut(),
        ins,
        &boundary,
        ITEM_INTERNAL,
        &internal_encode(right.blocknr()),
        large,
    )?;
    target.z().bump_version(sb.tree().next_version());
    {
        let _tw = sb.tree().lock_write();
        znode_set_parent(right, Some((&target, ins as u16)));
    }
    fix_children_from(sb, &target, ins + 1);
    zrelse(&target);
    longterm_unlock_znode(sb, plock);
    Ok(())
}

/// The root split: a fresh root one level up adopts the old root and its
/// new sibling, and the tree grows
fn grow_root(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    old_root: &JNodeRef,
    new_sibling: &JNodeRef,
    boundary: Key,
) -> RuntimeResult<()> {
    let large = sb.large_keys();
    let uber = sb.tree().uber();
    let uh = longterm_lock_znode(sb, stack, &uber, LockMode::Write, LockRequest::HIPRI)?;
    let (_, height) = sb.tree().root_info();
    let (root_j, root_lock) = match new_znode(sb, stack, height + 1) {
        Ok(r) => r,
        Err(e) => {
            longterm_unlock_znode(sb, uh);
            return Err(e);
        }
    };
    LAYOUT40.insert_item(
        root_j.jdata_mut(),
        0,
        &MIN_KEY,
        ITEM_INTERNAL,
        &internal_encode(old_root.blocknr()),
        large,
    )?;
    LAYOUT40.insert_item(
        root_j.jdata_mut(),
        1,
        &boundary,
        ITEM_INTERNAL,
        &internal_encode(new_sibling.blocknr()),
        large,
    )?;
    {
        let _tw = sb.tree().lock_write();
        let _dk = sb.tree().dk_guard();
        znode_set_dk(&root_j, MIN_KEY, crate::engine::key::MAX_KEY);
        znode_set_parent(&root_j, Some((&uber, 0)));
        znode_set_parent(old_root, Some((&root_j, 0)));
        znode_set_parent(new_sibling, Some((&root_j, 1)));
    }
    sb.tree().set_root(root_j.blocknr(), height + 1);
    log::info!(
        "tree: root split, height {} -> {}",
        height,
        height + 1
    );
    zrelse(&root_j);
    longterm_unlock_znode(sb, root_lock);
    longterm_unlock_znode(sb, uh);
    Ok(())
}

/*
    removal support
*/

/// The caller holds a write lock on an empty non-root node: take it out of
/// the tree. Pending lock requests on it drain with `Dying`
fn kill_node(sb: &VolumeSuper, stack: &Arc<LockStack>, lock: LockHandle) -> RuntimeResult<()> {
    let node = lock.node.clone();
    let large = sb.large_keys();
    let (parent, pos) = {
        let _tr = sb.tree().lock_read();
        match znode_parent_coord(&node) {
            Some(pc) => pc,
            None => {
                zrelse(&node);
                longterm_unlock_znode(sb, lock);
                return Err(Error::Restart);
            }
        }
    };
    let ph = match longterm_lock_znode(sb, stack, &parent, LockMode::Write, LockRequest::HIPRI) {
        Ok(h) => h,
        Err(e) => {
            zrelse(&node);
            longterm_unlock_znode(sb, lock);
            return Err(e);
        }
    };
    let pnode = ph.node.clone();
    if let Err(e) = jload(sb, &pnode) {
        zrelse(&node);
        longterm_unlock_znode(sb, lock);
        longterm_unlock_znode(sb, ph);
        return Err(e);
    }
    jnode_make_dirty(sb, &pnode);
    LAYOUT40.remove_item(pnode.jdata_mut(), pos as usize, large);
    pnode.z().bump_version(sb.tree().next_version());
    fix_children_from(sb, &pnode, pos as usize);
    // bridge the delimiting keys across the gap before the links go away
    let bridged = {
        let _tr = sb.tree().lock_read();
        let _dk = sb.tree().dk_guard();
        let l = crate::engine::znode::znode_left(&node);
        if let Some(l) = &l {
            update_boundary_key(l, &node, znode_get_rd_key(&node));
        }
        l
    };
    if let Some(l) = bridged {
        jput(sb, &l);
    }
    // the block itself: fake ones simply evaporate, real ones wait for the
    // commit to free them
    let blk = node.blocknr();
    if blk.is_fake() {
        sb.space().fake2free(1);
    } else if let Some(atom) = node.atom() {
        atom.lock().delete_set.insert(blk.raw());
    }
    znode_set_banshee(sb, &node);
    zrelse(&node);
    invalidate_lock(sb, lock);
    // cascade upward if the parent emptied out
    let parent_emptied = LAYOUT40.num_items(pnode.jdata()) == 0;
    let parent_is_root = {
        let _tr = sb.tree().lock_read();
        znode_parent_coord(&pnode)
            .map(|(p, _)| znode_is_uber(&p))
            .unwrap_or(true)
    };
    if parent_emptied && !parent_is_root {
        // the recursive kill consumes our pin on the parent
        kill_node(sb, stack, ph)
    } else {
        zrelse(&pnode);
        longterm_unlock_znode(sb, ph);
        Ok(())
    }
}

/*
    downlink upkeep
*/

/// Rewrite the parent downlink after `child` moved to a new block. Root
/// relocation retargets the root pointer instead
pub fn update_downlink(sb: &VolumeSuper, child: &JNodeRef) -> RuntimeResult<()> {
    let large = sb.large_keys();
    let pc = {
        let _tr = sb.tree().lock_read();
        znode_parent_coord(child)
    };
    match pc {
        None => {
            // orphan: nothing points here
            Ok(())
        }
        Some((parent, _)) if znode_is_uber(&parent) => {
            sb.tree().set_root_block(child.blocknr());
            Ok(())
        }
        Some((parent, pos)) => {
            jload(sb, &parent)?;
            let body = LAYOUT40.item_body_mut(parent.jdata_mut(), pos as usize, large);
            internal_set_child(body, child.blocknr());
            jrelse(&parent);
            Ok(())
        }
    }
}

/// Rebind the in-memory children of `node`'s downlink items from `from`
/// onward after their positions shifted
fn fix_children_from(sb: &VolumeSuper, node: &JNodeRef, from: usize) {
    let large = sb.large_keys();
    let _tw = sb.tree().lock_write();
    let data = node.jdata();
    let n = LAYOUT40.num_items(data);
    for i in from..n {
        if LAYOUT40.item_plugin(data, i, large) != ITEM_INTERNAL {
            continue;
        }
        let blk = internal_child(LAYOUT40.item_body(data, i, large));
        let key = crate::engine::cache::JKey::Formatted(blk);
        if let Some(child) = sb.tree().ztable().lookup(&key) {
            znode_set_parent(&child, Some((node, i as u16)));
        }
    }
}
