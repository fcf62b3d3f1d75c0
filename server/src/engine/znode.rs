/*
 * Created on Tue Jan 16 2024
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

//! The znode layer: tree topology over jnodes. A znode knows its level, the
//! coord of the downlink that points at it, its lazily-connected siblings
//! and the delimiting keys that bound its content. Topology is maintained
//! under the tree write-lock; delimiting keys under the dk guard

use {
    super::{
        block::{BlockNr, FAKE_TREE_ADDR},
        cache::{
            insert_into_table, jload, jref_lookup, jrelse, JNode, JNodeRef,
            JN_HEARD_BANSHEE, JN_LEFT_CONNECTED, JN_RIGHT_CONNECTED, JN_ORPHAN,
        },
        error::RuntimeResult,
        key::{Key, MAX_KEY, MIN_KEY},
        lock::LongTermLock,
        sb::VolumeSuper,
        sync::{ORD_ACQ, ORD_ACR, ORD_REL, ORD_RLX},
    },
    core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64},
    parking_lot::{Mutex, RwLock},
    std::sync::{Arc, Weak},
};

/// Tree levels: 1 is the leaf level, twig is right above it. Level 0 is
/// reserved for the virtual super-root's children bound
pub type TreeLevel = u8;
pub const LEAF_LEVEL: TreeLevel = 1;
pub const TWIG_LEVEL: TreeLevel = 2;
pub const MAX_TREE_HEIGHT: TreeLevel = 16;

/// unresolved node-layout plugin
pub const NPLUG_UNSET: u16 = u16::MAX;

/// The downlink position in the parent that points at a znode
#[derive(Clone)]
pub struct ParentCoord {
    pub parent: Weak<JNode>,
    pub item_pos: u16,
}

pub struct ZTopo {
    pub left: Option<Weak<JNode>>,
    pub right: Option<Weak<JNode>>,
    pub in_parent: Option<ParentCoord>,
}

pub struct DkKeys {
    pub ld: Key,
    pub rd: Key,
    pub ld_set: bool,
    pub rd_set: bool,
}

/// Formatted-node extension of a jnode
pub struct ZInfo {
    level: TreeLevel,
    /// tree-epoch stamp; refreshed by content edits so seals can tell a
    /// stale coord from a live one
    version: AtomicU64,
    c_count: AtomicU32,
    nplug: AtomicU16,
    pub topo: RwLock<ZTopo>,
    pub dk: Mutex<DkKeys>,
    pub lck: LongTermLock,
}

impl ZInfo {
    pub fn new(level: TreeLevel, version: u64) -> Self {
        Self {
            level,
            version: AtomicU64::new(version),
            c_count: AtomicU32::new(0),
            nplug: AtomicU16::new(NPLUG_UNSET),
            topo: RwLock::new(ZTopo {
                left: None,
                right: None,
                in_parent: None,
            }),
            dk: Mutex::new(DkKeys {
                ld: MIN_KEY,
                rd: MAX_KEY,
                ld_set: false,
                rd_set: false,
            }),
            lck: LongTermLock::new(),
        }
    }
    pub fn level(&self) -> TreeLevel {
        self.level
    }
    pub fn version(&self) -> u64 {
        self.version.load(ORD_ACQ)
    }
    pub fn bump_version(&self, v: u64) {
        self.version.store(v, ORD_REL);
    }
    pub fn c_count(&self) -> u32 {
        self.c_count.load(ORD_ACQ)
    }
    pub fn add_c_ref(&self) {
        self.c_count.fetch_add(1, ORD_ACR);
    }
    pub fn del_c_ref(&self) {
        let old = self.c_count.fetch_sub(1, ORD_ACR);
        dbg_invariant!(old >= 1);
    }
    pub fn nplug(&self) -> u16 {
        self.nplug.load(ORD_RLX)
    }
    pub fn set_nplug(&self, id: u16) {
        self.nplug.store(id, ORD_RLX);
    }
}

/*
    acquisition
*/

/// Obtain a referenced handle for the formatted node at `blocknr`, creating
/// the handle on a miss. `parent` is the coord of the downlink we came
/// through (`None` only for the root and the super-root)
pub fn zget(
    sb: &VolumeSuper,
    blocknr: BlockNr,
    parent: Option<(&JNodeRef, u16)>,
    level: TreeLevel,
) -> RuntimeResult<JNodeRef> {
    use super::cache::JKey;
    let key = JKey::Formatted(blocknr);
    {
        let _tr = sb.tree().lock_read();
        if let Some(found) = sb.tree().ztable().lookup(&key) {
            if let Some(j) = jref_lookup(&found) {
                dbg_invariant!(j.z().level() == level || level == 0);
                return Ok(j);
            }
        }
    }
    let _tw = sb.tree().lock_write();
    // somebody may have inserted while we upgraded
    if let Some(found) = sb.tree().ztable().lookup(&key) {
        if let Some(j) = jref_lookup(&found) {
            return Ok(j);
        }
    }
    let z = ZInfo::new(level, sb.tree().next_version());
    let j = JNode::new_znode(blocknr, z, sb.next_pg_index());
    if !blocknr.is_fake() {
        j.set_state(super::cache::JN_MAPPED);
    }
    if let Some((pnode, item_pos)) = parent {
        j.z().topo.write().in_parent = Some(ParentCoord {
            parent: Arc::downgrade(pnode),
            item_pos,
        });
        pnode.z().add_c_ref();
    } else {
        j.set_state(JN_ORPHAN);
    }
    insert_into_table(sb, &j);
    Ok(j)
}

/// Load + parse, pinning the data (see `jload`)
pub fn zload(sb: &VolumeSuper, j: &JNodeRef) -> RuntimeResult<()> {
    dbg_invariant!(j.is_znode());
    jload(sb, j)
}

pub fn zrelse(j: &JNodeRef) {
    jrelse(j)
}

/*
    super-root
*/

/// The in-memory parent of the real root. Locking it is how root-pointer
/// changes are serialized; its delimiting keys are the absolute bounds
pub fn create_uber(sb: &VolumeSuper, height: TreeLevel) -> RuntimeResult<JNodeRef> {
    let uber = zget(sb, FAKE_TREE_ADDR, None, height + 1)?;
    {
        let mut dk = uber.z().dk.lock();
        dk.ld = MIN_KEY;
        dk.rd = MAX_KEY;
        dk.ld_set = true;
        dk.rd_set = true;
    }
    Ok(uber)
}

pub fn znode_is_uber(j: &JNode) -> bool {
    j.blocknr().is_fake_tree_addr()
}

/*
    topology
*/

/// Parent handle, if the node still has a parent downlink. Tree lock (any
/// side) must be held. This is a transient borrow: take `jref` yourself if
/// the handle outlives the locked section
pub fn znode_parent(j: &JNode) -> Option<JNodeRef> {
    let topo = j.z().topo.read();
    let pc = topo.in_parent.as_ref()?;
    pc.parent.upgrade()
}

pub fn znode_parent_coord(j: &JNode) -> Option<(JNodeRef, u16)> {
    let topo = j.z().topo.read();
    let pc = topo.in_parent.as_ref()?;
    let parent = pc.parent.upgrade()?;
    Some((parent, pc.item_pos))
}

/// Rebind the parent coord (downlink moved by a shift or a split). Tree
/// write-lock must be held
pub fn znode_set_parent(child: &JNodeRef, parent: Option<(&JNodeRef, u16)>) {
    let old_parent = {
        let mut topo = child.z().topo.write();
        let old = topo.in_parent.take();
        match parent {
            Some((p, pos)) => {
                topo.in_parent = Some(ParentCoord {
                    parent: Arc::downgrade(p),
                    item_pos: pos,
                });
                child.clear_state(JN_ORPHAN);
                p.z().add_c_ref();
            }
            None => child.set_state(JN_ORPHAN),
        }
        old
    };
    if let Some(pc) = old_parent {
        if let Some(p) = pc.parent.upgrade() {
            p.z().del_c_ref();
        }
    }
}

/// Link `left` and `right` as siblings. Tree write-lock must be held
pub fn link_siblings(left: &JNodeRef, right: &JNodeRef) {
    dbg_invariant!(left.z().level() == right.z().level());
    left.z().topo.write().right = Some(Arc::downgrade(right));
    right.z().topo.write().left = Some(Arc::downgrade(left));
    left.set_state(JN_RIGHT_CONNECTED);
    right.set_state(JN_LEFT_CONNECTED);
}

/// Tear the sibling connection down around a node leaving the tree. Tree
/// write-lock must be held
pub fn unlink_siblings(j: &JNodeRef) {
    let (left, right) = {
        let topo = j.z().topo.read();
        (
            topo.left.as_ref().and_then(Weak::upgrade),
            topo.right.as_ref().and_then(Weak::upgrade),
        )
    };
    match (&left, &right) {
        (Some(l), Some(r)) => {
            // close the gap
            link_siblings(l, r);
        }
        (Some(l), None) => {
            l.z().topo.write().right = None;
            l.clear_state(JN_RIGHT_CONNECTED);
        }
        (None, Some(r)) => {
            r.z().topo.write().left = None;
            r.clear_state(JN_LEFT_CONNECTED);
        }
        (None, None) => {}
    }
    {
        let mut topo = j.z().topo.write();
        topo.left = None;
        topo.right = None;
    }
    j.clear_state(JN_LEFT_CONNECTED | JN_RIGHT_CONNECTED);
}

pub fn znode_left(j: &JNode) -> Option<JNodeRef> {
    if !j.test(JN_LEFT_CONNECTED) {
        return None;
    }
    let topo = j.z().topo.read();
    let l = topo.left.as_ref()?.upgrade()?;
    jref_lookup(&l)
}

pub fn znode_right(j: &JNode) -> Option<JNodeRef> {
    if !j.test(JN_RIGHT_CONNECTED) {
        return None;
    }
    let topo = j.z().topo.read();
    let r = topo.right.as_ref()?.upgrade()?;
    jref_lookup(&r)
}

/*
    delimiting keys
*/

/// Both reads are under the node's dk lock; multi-node updates additionally
/// serialize on the tree-wide dk guard
pub fn znode_get_ld_key(j: &JNode) -> Key {
    j.z().dk.lock().ld
}

pub fn znode_get_rd_key(j: &JNode) -> Key {
    j.z().dk.lock().rd
}

pub fn znode_dk_set(j: &JNode) -> bool {
    let dk = j.z().dk.lock();
    dk.ld_set && dk.rd_set
}

pub fn znode_set_dk(j: &JNode, ld: Key, rd: Key) {
    dbg_invariant!(ld <= rd);
    let mut dk = j.z().dk.lock();
    dk.ld = ld;
    dk.rd = rd;
    dk.ld_set = true;
    dk.rd_set = true;
}

/// Maintain `rd(left) == ld(right)` across a boundary move. Caller holds the
/// tree dk guard
pub fn update_boundary_key(left: &JNode, right: &JNode, boundary: Key) {
    {
        let mut dk = left.z().dk.lock();
        dk.rd = boundary;
        dk.rd_set = true;
    }
    {
        let mut dk = right.z().dk.lock();
        dk.ld = boundary;
        dk.ld_set = true;
    }
}

/// Does `key` fall inside this node's key range
pub fn znode_contains_key(j: &JNode, key: &Key) -> bool {
    let dk = j.z().dk.lock();
    dk.ld_set && dk.rd_set && dk.ld <= *key && *key < dk.rd
}

/*
    death
*/

/// The node was removed from the tree while handles may still be out. It
/// stays addressable but unreachable; locks on it are invalidated by the
/// lock manager
pub fn znode_set_banshee(sb: &VolumeSuper, j: &JNodeRef) {
    let _tw = sb.tree().lock_write();
    j.set_state(JN_HEARD_BANSHEE);
    unlink_siblings(j);
    if let Some(p) = {
        let mut topo = j.z().topo.write();
        topo.in_parent.take()
    }
    .and_then(|pc| pc.parent.upgrade())
    {
        p.z().del_c_ref();
    }
    j.set_state(JN_ORPHAN);
    sb.tree().cbk().invalidate(j);
}

/*
    debug invariants
*/

#[cfg(debug_assertions)]
pub fn znode_invariant(j: &JNode) {
    let z = j.z();
    {
        let dk = z.dk.lock();
        if dk.ld_set && dk.rd_set {
            dbg_invariant!(dk.ld <= dk.rd, "inverted delimiting keys");
        }
    }
    // parent is one level up
    if let Some((parent, _)) = znode_parent_coord(j) {
        if !znode_is_uber(&parent) {
            dbg_invariant!(parent.z().level() == z.level() + 1);
            dbg_invariant!(parent.z().c_count() > 0);
        }
    }
    // orphan has no parent
    if j.test(JN_ORPHAN) {
        dbg_invariant!(z.topo.read().in_parent.is_none());
    }
}
