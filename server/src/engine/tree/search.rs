/*
 * Created on Sun Jan 28 2024
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

//! `coord_by_key`: locate the coord a key lives at (or would be inserted
//! at), with a long-term lock of the requested strength held on the stop
//! node. The search probes the lookup cache first, then descends from the
//! super-root with lock coupling. `Restart`-class failures are absorbed
//! here by retrying the whole descent

use {
    super::{
        item::{item_ops, ITEM_INTERNAL},
        node::{Bias, NodeLookup, LAYOUT40, NodeOps},
        sibling, Between, Coord,
    },
    crate::engine::{
        cache::{jput, jref_lookup, JN_HEARD_BANSHEE},
        error::{Error, RuntimeResult},
        key::{Key, MAX_KEY, MIN_KEY},
        lock::{longterm_lock_znode, longterm_unlock_znode, LockHandle, LockMode, LockRequest, LockStack},
        sb::VolumeSuper,
        znode::{
            zget, zload, znode_contains_key, znode_dk_set, znode_get_rd_key, znode_set_dk,
            TreeLevel, TWIG_LEVEL,
        },
    },
    std::sync::Arc,
};

consts! {
    /// the key is known to have at most one occurrence
    pub CBK_UNIQUE: u32 = 1 << 0;
    /// trust delimiting keys without revalidation
    pub CBK_TRUST_DK: u32 = 1 << 1;
    /// dk of the start node is already known valid
    pub CBK_DKSET: u32 = 1 << 2;
    /// serve only from the lookup cache
    pub CBK_IN_CACHE: u32 = 1 << 3;
}

const RESTART_SOFT_LIMIT: u32 = 1024;
const RESTART_HARD_LIMIT: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbkOutcome {
    Found,
    NotFound,
}

/// A successful search: exactly one long-term lock held (on `coord.node`),
/// data pinned. Release with [`cbk_put`]
pub struct CbkResult {
    pub outcome: CbkOutcome,
    pub coord: Coord,
    pub lock: LockHandle,
}

/// Release the lock and the data pin a search result carries
pub fn cbk_put(sb: &VolumeSuper, res: CbkResult) {
    crate::engine::znode::zrelse(&res.coord.node);
    longterm_unlock_znode(sb, res.lock);
}

#[allow(clippy::too_many_arguments)]
pub fn coord_by_key(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    key: &Key,
    lock_mode: LockMode,
    bias: Bias,
    lock_level: TreeLevel,
    stop_level: TreeLevel,
    flags: u32,
) -> RuntimeResult<CbkResult> {
    let mut restarts = 0u32;
    loop {
        match cbk_once(sb, stack, key, lock_mode, bias, lock_level, stop_level, flags) {
            Ok(r) => return Ok(r),
            Err(e) if e.is_traversal_restart() || e == Error::Dying => {
                restarts += 1;
                stack.reset_signaled();
                if restarts == RESTART_SOFT_LIMIT {
                    log::warn!(
                        "tree: search for {:?} restarted {} times; starvation or corruption?",
                        key,
                        restarts
                    );
                }
                if restarts >= RESTART_HARD_LIMIT {
                    log::error!("tree: search for {:?} exceeded the restart bound", key);
                    return Err(Error::Io(std::io::ErrorKind::Other));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn cbk_once(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    key: &Key,
    lock_mode: LockMode,
    bias: Bias,
    lock_level: TreeLevel,
    stop_level: TreeLevel,
    flags: u32,
) -> RuntimeResult<CbkResult> {
    if let Some(hit) = cache_probe(sb, stack, key, lock_mode, bias, stop_level, flags)? {
        return Ok(hit);
    }
    if flags & CBK_IN_CACHE != 0 {
        return Err(Error::NotFound);
    }
    let (root_block, height) = sb.tree().root_info();
    if height == 0 || stop_level > height {
        return Err(Error::NotFound);
    }
    let large = sb.large_keys();
    // pin the root pointer by holding the super-root
    let uber = sb.tree().uber();
    let mut parent_lock =
        longterm_lock_znode(sb, stack, &uber, LockMode::Read, LockRequest::LOPRI)?;
    let mut child_block = root_block;
    let mut child_pos: u16 = 0;
    let mut child_dk: Option<(Key, Key)> = Some((MIN_KEY, MAX_KEY));
    let mut level = height;
    loop {
        let parent = parent_lock.node.clone();
        let child = match zget(sb, child_block, Some((&parent, child_pos)), level) {
            Ok(c) => c,
            Err(e) => {
                longterm_unlock_znode(sb, parent_lock);
                return Err(e);
            }
        };
        let mode = if level <= lock_level {
            lock_mode
        } else {
            LockMode::Read
        };
        let child_lock = match longterm_lock_znode(sb, stack, &child, mode, LockRequest::LOPRI) {
            Ok(l) => l,
            Err(e) => {
                jput(sb, &child);
                longterm_unlock_znode(sb, parent_lock);
                return Err(e);
            }
        };
        jput(sb, &child);
        let node = child_lock.node.clone();
        if let Err(e) = zload(sb, &node) {
            longterm_unlock_znode(sb, child_lock);
            longterm_unlock_znode(sb, parent_lock);
            return Err(e);
        }
        // propagate delimiting keys picked up in the parent
        if let Some((ld, rd)) = child_dk.take() {
            if !znode_dk_set(&node) {
                let _dk = sb.tree().dk_guard();
                znode_set_dk(&node, ld, rd);
            }
        }
        // the child may have been split or killed between the parent lookup
        // and our lock landing
        let stale = node.test(JN_HEARD_BANSHEE)
            || (flags & CBK_TRUST_DK == 0 && !znode_contains_key(&node, key));
        if stale {
            crate::engine::znode::zrelse(&node);
            longterm_unlock_znode(sb, child_lock);
            longterm_unlock_znode(sb, parent_lock);
            return Err(Error::Restart);
        }
        longterm_unlock_znode(sb, parent_lock);
        let nl = LAYOUT40.lookup(node.jdata(), key, large);
        if level == stop_level {
            return finish_at_stop(sb, stack, child_lock, nl, key, bias, flags);
        }
        if nl.before_first {
            // the dk said the key belongs here, the content disagrees
            crate::engine::znode::zrelse(&node);
            longterm_unlock_znode(sb, child_lock);
            return Err(Error::Restart);
        }
        let data = node.jdata();
        let plug = LAYOUT40.item_plugin(data, nl.pos, large);
        if plug != ITEM_INTERNAL {
            // end of tree at twig: an extent speaks for this key range and
            // there is no leaf below it
            dbg_invariant!(level == TWIG_LEVEL);
            return finish_at_stop(sb, stack, child_lock, nl, key, bias, flags);
        }
        let next = super::item::internal_child(LAYOUT40.item_body(data, nl.pos, large));
        // pick up the child's dk while we still have this node's data
        let n = LAYOUT40.num_items(data);
        let ld = LAYOUT40.item_key(data, nl.pos, large);
        let rd = if nl.pos + 1 < n {
            LAYOUT40.item_key(data, nl.pos + 1, large)
        } else {
            znode_get_rd_key(&node)
        };
        child_dk = Some((ld, rd));
        crate::engine::znode::zrelse(&node);
        parent_lock = child_lock;
        child_block = next;
        child_pos = nl.pos as u16;
        level -= 1;
    }
}

/// Build the final coord at the stop node. Consumes the lock on success
/// and failure alike (failure = release)
fn finish_at_stop(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    lock: LockHandle,
    nl: NodeLookup,
    key: &Key,
    // Exact and MaxNotMoreThan agree at the stop node: the coord always
    // settles on the max-not-more unit and `covered` decides the outcome
    _bias: Bias,
    flags: u32,
) -> RuntimeResult<CbkResult> {
    let node = lock.node.clone();
    let large = sb.large_keys();
    let data = node.jdata();
    let n = LAYOUT40.num_items(data);
    let (outcome, coord) = if n == 0 {
        (
            CbkOutcome::NotFound,
            Coord {
                node: node.clone(),
                item_pos: 0,
                unit_pos: 0,
                between: Between::EmptyNode,
            },
        )
    } else if nl.before_first {
        (
            CbkOutcome::NotFound,
            Coord {
                node: node.clone(),
                item_pos: 0,
                unit_pos: 0,
                between: Between::BeforeItem,
            },
        )
    } else {
        let ik = LAYOUT40.item_key(data, nl.pos, large);
        let plug = LAYOUT40.item_plugin(data, nl.pos, large);
        let body = LAYOUT40.item_body(data, nl.pos, large);
        let ops = match item_ops(plug) {
            Ok(ops) => ops,
            Err(e) => {
                crate::engine::znode::zrelse(&node);
                longterm_unlock_znode(sb, lock);
                return Err(e);
            }
        };
        let ul = ops.lookup_unit(&ik, key, body);
        if ul.covered {
            (
                CbkOutcome::Found,
                Coord {
                    node: node.clone(),
                    item_pos: nl.pos as u16,
                    unit_pos: ul.unit as u16,
                    between: Between::AtUnit,
                },
            )
        } else {
            (
                CbkOutcome::NotFound,
                Coord {
                    node: node.clone(),
                    item_pos: nl.pos as u16,
                    unit_pos: ul.unit as u16,
                    between: Between::AfterUnit,
                },
            )
        }
    };
    let mut res = CbkResult {
        outcome,
        coord,
        lock,
    };
    // non-unique keys may continue in the left neighbor; walk left while
    // the match sits at the very edge
    if res.outcome == CbkOutcome::Found
        && flags & CBK_UNIQUE == 0
        && res.coord.item_pos == 0
        && res.coord.unit_pos == 0
    {
        res = scan_left_for_key(sb, stack, res, key)?;
    }
    sb.tree().cbk().bump(&res.coord.node);
    Ok(res)
}

/// The found coord is the leftmost unit of its node: earlier occurrences
/// of a non-unique key would live in the left neighbor. Hop left while
/// that is the case
fn scan_left_for_key(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    mut res: CbkResult,
    key: &Key,
) -> RuntimeResult<CbkResult> {
    let large = sb.large_keys();
    loop {
        let left = match sibling::get_left_neighbor(sb, stack, &res.coord.node, res.lock.mode) {
            Ok(l) => l,
            // no left neighbor, or contention: the current hit stands
            Err(Error::NotFound) | Err(Error::WouldBlock) => return Ok(res),
            Err(e) => {
                cbk_put(sb, res);
                return Err(e);
            }
        };
        let lnode = left.node.clone();
        if let Err(e) = zload(sb, &lnode) {
            longterm_unlock_znode(sb, left);
            cbk_put(sb, res);
            return Err(e);
        }
        let data = lnode.jdata();
        let n = LAYOUT40.num_items(data);
        let continues = n > 0 && LAYOUT40.item_key(data, n - 1, large) == *key;
        if !continues {
            crate::engine::znode::zrelse(&lnode);
            longterm_unlock_znode(sb, left);
            return Ok(res);
        }
        cbk_put(sb, res);
        res = CbkResult {
            outcome: CbkOutcome::Found,
            coord: Coord {
                node: lnode,
                item_pos: (n - 1) as u16,
                unit_pos: 0,
                between: Between::AtUnit,
            },
            lock: left,
        };
        if res.coord.item_pos != 0 {
            return Ok(res);
        }
    }
}

/// Try to serve the search from the lookup cache: any slot of the right
/// level that strictly contains the key is locked and probed
fn cache_probe(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    key: &Key,
    lock_mode: LockMode,
    bias: Bias,
    stop_level: TreeLevel,
    flags: u32,
) -> RuntimeResult<Option<CbkResult>> {
    let large = sb.large_keys();
    for slot in sb.tree().cbk().snapshot() {
        if !slot.is_znode() || slot.z().level() != stop_level || slot.test(JN_HEARD_BANSHEE) {
            continue;
        }
        {
            // strict containment so edge keys fall through to a full
            // descent
            let _tr = sb.tree().lock_read();
            let dk = slot.z().dk.lock();
            if !(dk.ld_set && dk.rd_set && dk.ld < *key && *key < dk.rd) {
                continue;
            }
        }
        let node = match jref_lookup(&slot) {
            Some(n) => n,
            None => continue,
        };
        let lock = match longterm_lock_znode(sb, stack, &node, lock_mode, LockRequest::LOPRI) {
            Ok(l) => l,
            Err(Error::Dying) => {
                jput(sb, &node);
                continue;
            }
            Err(e) => {
                jput(sb, &node);
                return Err(e);
            }
        };
        jput(sb, &node);
        let locked = lock.node.clone();
        if let Err(e) = zload(sb, &locked) {
            longterm_unlock_znode(sb, lock);
            return Err(e);
        }
        let still_good = !locked.test(JN_HEARD_BANSHEE) && znode_contains_key(&locked, key);
        if !still_good {
            crate::engine::znode::zrelse(&locked);
            longterm_unlock_znode(sb, lock);
            continue;
        }
        let nl = LAYOUT40.lookup(locked.jdata(), key, large);
        return finish_at_stop(sb, stack, lock, nl, key, bias, flags).map(Some);
    }
    Ok(None)
}
