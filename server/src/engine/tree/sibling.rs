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

//! Sibling traversal. Neighbors connect lazily: the first walk across a
//! boundary climbs through the common ancestor, re-descends on the far
//! side and links the pair. Left-going walks run at low priority, right-
//! going at high priority, matching the deadlock-avoidance classes

use {
    super::{
        item::internal_child,
        node::{NodeOps, LAYOUT40},
    },
    crate::engine::{
        cache::{jput, JNodeRef},
        error::{Error, RuntimeResult},
        lock::{longterm_lock_znode, longterm_unlock_znode, LockHandle, LockMode, LockRequest, LockStack},
        sb::VolumeSuper,
        znode::{
            link_siblings, update_boundary_key, zget, zload, znode_get_ld_key, znode_left,
            znode_parent_coord, znode_right, zrelse,
        },
    },
    std::sync::Arc,
};

/// Lock the left neighbor of `node`, connecting it first if needed.
/// `NotFound` means the node is the leftmost of its level
pub fn get_left_neighbor(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    node: &JNodeRef,
    mode: LockMode,
) -> RuntimeResult<LockHandle> {
    neighbor(sb, stack, node, mode, Side::Left)
}

/// Lock the right neighbor of `node`, connecting it first if needed.
/// Right-going walks are the balancing direction and run high priority
pub fn get_right_neighbor(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    node: &JNodeRef,
    mode: LockMode,
) -> RuntimeResult<LockHandle> {
    neighbor(sb, stack, node, mode, Side::Right)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn request(&self) -> LockRequest {
        match self {
            Side::Left => LockRequest::LOPRI,
            Side::Right => LockRequest::HIPRI,
        }
    }
}

fn neighbor(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    node: &JNodeRef,
    mode: LockMode,
    side: Side,
) -> RuntimeResult<LockHandle> {
    // fast path: already connected
    let connected = {
        let _tr = sb.tree().lock_read();
        match side {
            Side::Left => znode_left(node),
            Side::Right => znode_right(node),
        }
    };
    if let Some(sib) = connected {
        let h = longterm_lock_znode(sb, stack, &sib, mode, side.request());
        jput(sb, &sib);
        return h;
    }
    // climb to the parent and look one downlink over
    let (parent, pos) = {
        let _tr = sb.tree().lock_read();
        match znode_parent_coord(node) {
            Some(pc) => pc,
            None => return Err(Error::NotFound),
        }
    };
    let ph = longterm_lock_znode(sb, stack, &parent, LockMode::Read, side.request())?;
    let pnode = ph.node.clone();
    if let Err(e) = zload(sb, &pnode) {
        longterm_unlock_znode(sb, ph);
        return Err(e);
    }
    let res = neighbor_via_parent(sb, stack, node, &pnode, pos, mode, side);
    zrelse(&pnode);
    longterm_unlock_znode(sb, ph);
    res
}

fn neighbor_via_parent(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    node: &JNodeRef,
    parent: &JNodeRef,
    pos: u16,
    mode: LockMode,
    side: Side,
) -> RuntimeResult<LockHandle> {
    let data = parent.jdata();
    let n = LAYOUT40.num_items(data);
    let adjacent: Option<u16> = match side {
        Side::Left if pos > 0 => Some(pos - 1),
        Side::Right if (pos as usize) + 1 < n => Some(pos + 1),
        _ => None,
    };
    let target_pos = match adjacent {
        Some(p) => p,
        None => {
            // the neighbor hangs off the parent's own neighbor: recurse up
            // and come back down on the far edge
            let pph = neighbor(sb, stack, parent, LockMode::Read, side)?;
            let pp = pph.node.clone();
            let res = (|| -> RuntimeResult<LockHandle> {
                zload(sb, &pp)?;
                let pdata = pp.jdata();
                let pn = LAYOUT40.num_items(pdata);
                if pn == 0 {
                    zrelse(&pp);
                    return Err(Error::NotFound);
                }
                let edge = match side {
                    Side::Left => (pn - 1) as u16,
                    Side::Right => 0,
                };
                let r = descend_and_link(sb, stack, node, &pp, edge, mode, side);
                zrelse(&pp);
                r
            })();
            longterm_unlock_znode(sb, pph);
            return res;
        }
    };
    descend_and_link(sb, stack, node, parent, target_pos, mode, side)
}

/// Lock the child at `parent[pos]` and link it with `node` as siblings
fn descend_and_link(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    node: &JNodeRef,
    parent: &JNodeRef,
    pos: u16,
    mode: LockMode,
    side: Side,
) -> RuntimeResult<LockHandle> {
    let large = sb.large_keys();
    let data = parent.jdata();
    let body = LAYOUT40.item_body(data, pos as usize, large);
    let block = internal_child(body);
    let level = node.z().level();
    let sib = zget(sb, block, Some((parent, pos)), level)?;
    let h = match longterm_lock_znode(sb, stack, &sib, mode, side.request()) {
        Ok(h) => h,
        Err(e) => {
            jput(sb, &sib);
            return Err(e);
        }
    };
    jput(sb, &sib);
    {
        let _tw = sb.tree().lock_write();
        let _dk = sb.tree().dk_guard();
        match side {
            Side::Left => {
                link_siblings(&h.node, node);
                update_boundary_key(&h.node, node, znode_get_ld_key(node));
            }
            Side::Right => {
                link_siblings(node, &h.node);
                update_boundary_key(node, &h.node, crate::engine::znode::znode_get_rd_key(node));
            }
        }
    }
    Ok(h)
}
