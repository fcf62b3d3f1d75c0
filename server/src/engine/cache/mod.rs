/*
 * Created on Mon Jan 15 2024
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

//! The jnode layer: one canonical in-memory identity for every block the
//! engine touches. A jnode unifies hash lookup, page binding, reference
//! counting and per-type lifecycle; the formatted specialization (znode)
//! layers tree topology on top (see `znode`)
//!
//! Two reference counts:
//! - `x_count`: handle references. The handle exists in memory iff it is in
//!   the hash table or `x_count > 0`
//! - `d_count`: data references; the page cannot be detached or emergency
//!   flushed while `d_count > 0`. `d_count <= x_count` always

pub mod table;

use {
    super::{
        block::BlockNr,
        error::{Error, RuntimeResult},
        sb::VolumeSuper,
        sync::{ORD_ACQ, ORD_ACR, ORD_SEQ},
        tree::node,
        txn::Atom,
        vdev::{
            page::{MappingId, Page, PG_DIRTY, PG_UPTODATE},
            BLOCK_SIZE,
        },
        znode::ZInfo,
    },
    core::sync::atomic::AtomicU32,
    parking_lot::Mutex,
    std::sync::Arc,
};

/*
    state bits
*/

consts! {
    /// data is in memory and parsed
    pub JN_LOADED: u32 = 1 << 0;
    /// the node was deleted while references were still out; it must not be
    /// reached through the tree anymore
    pub JN_HEARD_BANSHEE: u32 = 1 << 1;
    /// left sibling pointer is valid
    pub JN_LEFT_CONNECTED: u32 = 1 << 2;
    /// right sibling pointer is valid
    pub JN_RIGHT_CONNECTED: u32 = 1 << 3;
    /// no parent downlink references this node
    pub JN_ORPHAN: u32 = 1 << 4;
    /// created in this session; no disk content to read
    pub JN_CREATED: u32 = 1 << 5;
    /// commit will write this node to a new location
    pub JN_RELOC: u32 = 1 << 6;
    /// commit will overwrite this node in place (wandered first)
    pub JN_OVRWR: u32 = 1 << 7;
    /// modified relative to disk; implies a captured atom
    pub JN_DIRTY: u32 = 1 << 8;
    /// the node is being invalidated
    pub JN_DYING: u32 = 1 << 9;
    /// a real disk block is assigned
    pub JN_MAPPED: u32 = 1 << 10;
    /// page content was pushed to an emergency location
    pub JN_EFLUSH: u32 = 1 << 11;
    /// sitting on a flush queue
    pub JN_FLUSH_QUEUED: u32 = 1 << 12;
    /// jnode type, 3 bits
    pub JN_TYPE_SHIFT: u32 = 13;
    pub JN_TYPE_MASK: u32 = 0b111 << 13;
    /// the handle is on its way out of the hash table; blocks resurrection
    pub JN_RIP: u32 = 1 << 16;
    /// seen by flush before capture could take it
    pub JN_MISSED_IN_CAPTURE: u32 = 1 << 17;
    /// write-back in flight
    pub JN_WRITEBACK: u32 = 1 << 18;
    /// never yet written to disk
    pub JN_NEW: u32 = 1 << 19;
    /// content validated by the owning plugin
    pub JN_PARSED: u32 = 1 << 20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JType {
    Unformatted = 0,
    Formatted = 1,
    Bitmap = 2,
    IoHead = 3,
    Inode = 4,
}

/// Identity of a jnode in the hash tables, discriminated the way the type
/// keys itself: formatted nodes by block number, unformatted blocks by
/// (object, file index), the rest by an address-derived value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JKey {
    Formatted(BlockNr),
    Unformatted { oid: u64, index: u64 },
    Bitmap(u64),
    IoHead(BlockNr),
    Inode(u64),
}

impl JKey {
    pub fn bucket_seed(&self) -> u64 {
        match self {
            JKey::Formatted(b) => b.raw(),
            JKey::Unformatted { oid, index } => oid.wrapping_add(*index),
            JKey::Bitmap(idx) => BlockNr::fake_bitmap(*idx).raw(),
            JKey::IoHead(b) => b.raw().rotate_left(17),
            JKey::Inode(oid) => oid.rotate_left(31),
        }
    }
}

/// Type-specific payload, fixed at creation
pub enum JVariant {
    Unformatted { oid: u64, index: u64 },
    Formatted(Box<ZInfo>),
    Bitmap { index: u64 },
    IoHead,
    Inode { oid: u64 },
}

/// Fields under the jnode spin lock
pub struct JGuarded {
    pub blocknr: BlockNr,
    pub page: Option<Arc<Page>>,
    pub atom: Option<Arc<Atom>>,
    pub eflush: Option<BlockNr>,
}

pub struct JNode {
    state: AtomicU32,
    d_count: AtomicU32,
    x_count: AtomicU32,
    // stable page index in this node's address space
    pg_index: u64,
    key: Mutex<JKey>,
    g: Mutex<JGuarded>,
    v: JVariant,
}

pub type JNodeRef = Arc<JNode>;

impl JNode {
    fn alloc(key: JKey, blocknr: BlockNr, pg_index: u64, v: JVariant) -> JNodeRef {
        let typ = match v {
            JVariant::Unformatted { .. } => JType::Unformatted,
            JVariant::Formatted(_) => JType::Formatted,
            JVariant::Bitmap { .. } => JType::Bitmap,
            JVariant::IoHead => JType::IoHead,
            JVariant::Inode { .. } => JType::Inode,
        };
        Arc::new(Self {
            state: AtomicU32::new((typ as u32) << JN_TYPE_SHIFT),
            d_count: AtomicU32::new(0),
            x_count: AtomicU32::new(1),
            pg_index,
            key: Mutex::new(key),
            g: Mutex::new(JGuarded {
                blocknr,
                page: None,
                atom: None,
                eflush: None,
            }),
            v,
        })
    }
    pub fn new_unformatted(oid: u64, index: u64) -> JNodeRef {
        let j = Self::alloc(
            JKey::Unformatted { oid, index },
            BlockNr::fake_unallocated(index),
            index,
            JVariant::Unformatted { oid, index },
        );
        j.set_state(JN_NEW);
        j
    }
    pub fn new_znode(blocknr: BlockNr, z: ZInfo, pg_index: u64) -> JNodeRef {
        Self::alloc(
            JKey::Formatted(blocknr),
            blocknr,
            pg_index,
            JVariant::Formatted(Box::new(z)),
        )
    }
    pub fn new_bitmap(index: u64) -> JNodeRef {
        Self::alloc(
            JKey::Bitmap(index),
            BlockNr::fake_bitmap(index),
            index,
            JVariant::Bitmap { index },
        )
    }
    pub fn new_io_head(blocknr: BlockNr, pg_index: u64) -> JNodeRef {
        let j = Self::alloc(JKey::IoHead(blocknr), blocknr, pg_index, JVariant::IoHead);
        j.set_state(JN_MAPPED);
        j
    }
    pub fn new_inode(oid: u64) -> JNodeRef {
        Self::alloc(
            JKey::Inode(oid),
            BlockNr::fake_unallocated(oid),
            0,
            JVariant::Inode { oid },
        )
    }
}

/*
    state and accessors
*/

impl JNode {
    pub fn jtype(&self) -> JType {
        match self.v {
            JVariant::Unformatted { .. } => JType::Unformatted,
            JVariant::Formatted(_) => JType::Formatted,
            JVariant::Bitmap { .. } => JType::Bitmap,
            JVariant::IoHead => JType::IoHead,
            JVariant::Inode { .. } => JType::Inode,
        }
    }
    pub fn is_znode(&self) -> bool {
        matches!(self.v, JVariant::Formatted(_))
    }
    /// The formatted-node extension. Must only be called on znodes
    pub fn z(&self) -> &ZInfo {
        extract!(&self.v, JVariant::Formatted(z) => z)
    }
    pub fn test(&self, bit: u32) -> bool {
        self.state.load(ORD_ACQ) & bit != 0
    }
    pub fn set_state(&self, bit: u32) {
        self.state.fetch_or(bit, ORD_ACR);
    }
    pub fn clear_state(&self, bit: u32) {
        self.state.fetch_and(!bit, ORD_ACR);
    }
    pub fn is_dirty(&self) -> bool {
        self.test(JN_DIRTY)
    }
    pub fn is_loaded(&self) -> bool {
        self.test(JN_LOADED)
    }
    pub fn x_count(&self) -> u32 {
        self.x_count.load(ORD_ACQ)
    }
    pub fn d_count(&self) -> u32 {
        self.d_count.load(ORD_ACQ)
    }
    pub fn jkey(&self) -> JKey {
        *self.key.lock()
    }
    pub fn blocknr(&self) -> BlockNr {
        self.g.lock().blocknr
    }
    pub fn pg_index(&self) -> u64 {
        self.pg_index
    }
    pub fn guarded(&self) -> parking_lot::MutexGuard<'_, JGuarded> {
        self.g.lock()
    }
    pub fn atom(&self) -> Option<Arc<Atom>> {
        self.g.lock().atom.clone()
    }
    pub fn page(&self) -> Option<Arc<Page>> {
        self.g.lock().page.clone()
    }
    pub fn mapping(&self) -> MappingId {
        match &self.v {
            JVariant::Unformatted { oid, .. } => MappingId::Object(*oid),
            JVariant::Formatted(_) => MappingId::Formatted,
            JVariant::Bitmap { .. } => MappingId::Bitmap,
            JVariant::IoHead => MappingId::IoHead,
            JVariant::Inode { oid } => MappingId::Object(*oid),
        }
    }
    /// Page data, read side. Caller must have the node loaded (this is what
    /// keeps the page attached) and must serialize content access through a
    /// long-term lock or atom membership
    pub fn jdata(&self) -> &[u8] {
        dbg_invariant!(self.is_loaded() && self.d_count() > 0);
        let g = self.g.lock();
        let pg = extract!(&g.page, Some(p) => p);
        unsafe {
            // UNSAFE(@ohsayan): the page stays attached while d_count > 0,
            // so the buffer outlives this borrow of the jnode
            core::slice::from_raw_parts(pg.data().as_ptr(), BLOCK_SIZE)
        }
    }
    /// Page data, write side. Same contract as [`JNode::jdata`] with write
    /// exclusivity on top
    #[allow(clippy::mut_from_ref)]
    pub fn jdata_mut(&self) -> &mut [u8] {
        dbg_invariant!(self.is_loaded() && self.d_count() > 0);
        let g = self.g.lock();
        let pg = extract!(&g.page, Some(p) => p);
        unsafe {
            // UNSAFE(@ohsayan): see jdata; writers additionally hold a write
            // long-term lock or are the only thread that can see the node
            core::slice::from_raw_parts_mut(pg.data_mut().as_mut_ptr(), BLOCK_SIZE)
        }
    }
}

/*
    type vtable
*/

/// Per-type hooks consumed by the generic lifecycle paths
pub struct JTypePlugin {
    pub name: &'static str,
    /// validate freshly read content
    pub parse: fn(&VolumeSuper, &JNodeRef) -> RuntimeResult<()>,
}

fn parse_nop(_: &VolumeSuper, _: &JNodeRef) -> RuntimeResult<()> {
    Ok(())
}

fn parse_formatted(sb: &VolumeSuper, j: &JNodeRef) -> RuntimeResult<()> {
    node::parse_znode(sb, j)
}

pub static JTYPE_TABLE: [JTypePlugin; 5] = [
    JTypePlugin {
        name: "unformatted",
        parse: parse_nop,
    },
    JTypePlugin {
        name: "formatted",
        parse: parse_formatted,
    },
    JTypePlugin {
        name: "bitmap",
        parse: parse_nop,
    },
    JTypePlugin {
        name: "io_head",
        parse: parse_nop,
    },
    JTypePlugin {
        name: "inode",
        parse: parse_nop,
    },
];

pub fn jplugin(j: &JNode) -> &'static JTypePlugin {
    &JTYPE_TABLE[j.jtype() as usize]
}

/*
    reference counting
*/

/// Take another handle reference on a jnode we already hold
pub fn jref(j: &JNodeRef) -> JNodeRef {
    let old = j.x_count.fetch_add(1, ORD_SEQ);
    dbg_invariant!(old > 0, "jref on a dead handle");
    j.clone()
}

/// Resurrect a handle found through a hash lookup: 0 -> 1 transitions race
/// against RIP and lose
pub fn jref_lookup(j: &JNodeRef) -> Option<JNodeRef> {
    j.x_count.fetch_add(1, ORD_SEQ);
    if j.test(JN_RIP) {
        j.x_count.fetch_sub(1, ORD_SEQ);
        None
    } else {
        Some(j.clone())
    }
}

/// Release a handle reference. The last put decides whether the handle stays
/// cached (page still bound or data pinned by an atom) or leaves the table
pub fn jput(sb: &VolumeSuper, j: &JNodeRef) {
    let old = j.x_count.fetch_sub(1, ORD_SEQ);
    dbg_invariant!(old >= 1);
    if old == 1 {
        jput_final(sb, j);
    }
}

fn jput_final(sb: &VolumeSuper, j: &JNodeRef) {
    let _tw = sb.tree().lock_write();
    // rip-first ordering: a concurrent lookup that increments x_count after
    // this point will observe RIP and back off; one that got in before will
    // be visible in the recheck below
    j.set_state(JN_RIP);
    if j.x_count.load(ORD_SEQ) > 0 {
        j.clear_state(JN_RIP);
        return;
    }
    let keep_cached = {
        let g = j.g.lock();
        let anchored = g.page.is_some()
            || g.atom.is_some()
            || j.is_dirty()
            || (j.is_znode() && j.z().c_count() > 0);
        !j.test(JN_HEARD_BANSHEE) && anchored
    };
    if keep_cached {
        j.clear_state(JN_RIP);
        return;
    }
    remove_from_table(sb, j);
    if let Some(pg) = j.page() {
        detach_page(sb, j, &pg);
    }
}

fn table_for<'a>(sb: &'a VolumeSuper, j: &JNode) -> &'a table::JTable {
    if j.is_znode() {
        sb.tree().ztable()
    } else {
        sb.tree().jtable()
    }
}

/// Tree write-lock must be held
pub fn remove_from_table(sb: &VolumeSuper, j: &JNodeRef) {
    let key = j.jkey();
    let _ = table_for(sb, j).remove(&key);
}

/// Tree write-lock must be held; key must be absent
pub fn insert_into_table(sb: &VolumeSuper, j: &JNodeRef) {
    table_for(sb, j).insert(j.jkey(), j.clone());
}

/// Re-key a formatted node when its block number changes (relocation).
/// Takes the tree write-lock
pub fn jnode_set_block(sb: &VolumeSuper, j: &JNodeRef, new: BlockNr) {
    let _tw = sb.tree().lock_write();
    let old_key = j.jkey();
    {
        let mut g = j.g.lock();
        g.blocknr = new;
    }
    if j.is_znode() {
        let new_key = JKey::Formatted(new);
        *j.key.lock() = new_key;
        sb.tree().ztable().rehash(&old_key, new_key);
    }
    if !new.is_fake() {
        j.set_state(JN_MAPPED);
    }
}

/*
    page binding
*/

/// Bind `page` to `j`. Caller holds the page lock; we take the jnode lock
pub fn attach_page(j: &JNodeRef, page: &Arc<Page>) {
    dbg_invariant!(page.is_locked());
    let mut g = j.g.lock();
    dbg_invariant!(g.page.is_none());
    page.set_private(j);
    g.page = Some(page.clone());
}

/// Unbind. Caller holds the page lock; drops the cache entry as well
pub fn detach_page(sb: &VolumeSuper, j: &JNodeRef, page: &Arc<Page>) {
    let mut g = j.g.lock();
    if let Some(cur) = &g.page {
        if Arc::ptr_eq(cur, page) {
            g.page = None;
            page.clear_private();
            sb.pages().remove(page.mapping(), page.index());
        }
    }
}

/// Lock the page bound to `j`, resolving the inverse lock order (we want
/// jnode -> page, the canonical order is page -> jnode) with a trylock loop
pub fn jnode_lock_page(j: &JNodeRef) -> Option<Arc<Page>> {
    loop {
        let pg = j.g.lock().page.clone()?;
        if pg.try_lock() {
            if j.g.lock().page.as_ref().is_some_and(|p| Arc::ptr_eq(p, &pg)) {
                return Some(pg);
            }
            pg.unlock();
            continue;
        }
        // contended: wait without holding the jnode lock, then revalidate
        pg.lock();
        if j.g.lock().page.as_ref().is_some_and(|p| Arc::ptr_eq(p, &pg)) {
            return Some(pg);
        }
        pg.unlock();
    }
}

/// Find or create the page backing `j` and bind it
fn jnode_get_page(sb: &VolumeSuper, j: &JNodeRef) -> Arc<Page> {
    if let Some(pg) = j.page() {
        return pg;
    }
    let pg = sb.pages().find_or_create(j.mapping(), j.pg_index());
    pg.lock();
    if j.page().is_none() {
        attach_page(j, &pg);
    }
    pg.unlock();
    // someone else may have attached a different page first
    j.page().unwrap_or(pg)
}

/*
    load / release
*/

/// Pin the node's data in memory, reading and parsing it on first load.
/// Idempotent over `d_count`
pub fn jload(sb: &VolumeSuper, j: &JNodeRef) -> RuntimeResult<()> {
    j.d_count.fetch_add(1, ORD_SEQ);
    if j.is_loaded() {
        return Ok(());
    }
    match jload_slow(sb, j) {
        Ok(()) => Ok(()),
        Err(e) => {
            j.d_count.fetch_sub(1, ORD_SEQ);
            Err(e)
        }
    }
}

fn jload_slow(sb: &VolumeSuper, j: &JNodeRef) -> RuntimeResult<()> {
    let pg = jnode_get_page(sb, j);
    pg.lock();
    let res: RuntimeResult<()> = (|| {
        if !pg.test(PG_UPTODATE) {
            let (blocknr, eflushed) = {
                let g = j.g.lock();
                match g.eflush {
                    Some(e) => (e, true),
                    None => (g.blocknr, false),
                }
            };
            if !eflushed && (blocknr.is_fake() || j.test(JN_CREATED) || j.test(JN_NEW)) {
                // fresh node: nothing on disk yet
                unsafe {
                    // UNSAFE(@ohsayan): page lock held
                    pg.data_mut().fill(0)
                }
                pg.set(PG_UPTODATE);
            } else {
                pg.read_from(&**sb.dev(), blocknr)?;
                if eflushed {
                    eflush_unflush(sb, j);
                }
            }
        }
        Ok(())
    })();
    pg.unlock();
    res?;
    if !j.test(JN_PARSED) {
        (jplugin(j).parse)(sb, j)?;
        j.set_state(JN_PARSED);
    }
    j.set_state(JN_LOADED);
    Ok(())
}

/// Release a data pin
pub fn jrelse(j: &JNodeRef) {
    let old = j.d_count.fetch_sub(1, ORD_SEQ);
    dbg_invariant!(old >= 1);
}

/// Create or fetch the unformatted jnode indexing `page`'s block. Inserts
/// into the per-object index (the page mapping) and the global hash
pub fn jnode_of_page(sb: &VolumeSuper, oid: u64, page: &Arc<Page>) -> JNodeRef {
    dbg_invariant!(page.is_locked());
    if let Some(existing) = page.private() {
        if let Some(j) = jref_lookup(&existing) {
            return j;
        }
    }
    let key = JKey::Unformatted {
        oid,
        index: page.index(),
    };
    let _tw = sb.tree().lock_write();
    if let Some(found) = sb.tree().jtable().lookup(&key) {
        if let Some(j) = jref_lookup(&found) {
            if j.page().is_none() {
                attach_page(&j, page);
            }
            return j;
        }
    }
    let j = JNode::new_unformatted(oid, page.index());
    sb.tree().jtable().insert(key, j.clone());
    attach_page(&j, page);
    j
}

/*
    eviction
*/

#[derive(Debug, PartialEq, Eq)]
pub enum DropOutcome {
    Dropped,
    Busy,
}

/// Attempt to evict a cached handle the caller holds the only reference to.
/// Fails with [`DropOutcome::Busy`] when data is pinned, the node is dirty
/// or captured, or the page cannot be locked right now
pub fn jnode_try_drop(sb: &VolumeSuper, j: &JNodeRef) -> DropOutcome {
    let _tw = sb.tree().lock_write();
    if j.d_count() > 0 || j.is_dirty() || j.x_count.load(ORD_SEQ) > 1 {
        return DropOutcome::Busy;
    }
    {
        let g = j.g.lock();
        if g.atom.is_some() {
            return DropOutcome::Busy;
        }
    }
    let page = j.page();
    if let Some(pg) = &page {
        if !pg.try_lock() {
            return DropOutcome::Busy;
        }
        if pg.test(PG_DIRTY) {
            pg.unlock();
            return DropOutcome::Busy;
        }
    }
    j.set_state(JN_RIP);
    remove_from_table(sb, j);
    if let Some(pg) = &page {
        detach_page(sb, j, pg);
        pg.unlock();
    }
    j.clear_state(JN_LOADED | JN_PARSED);
    j.x_count.fetch_sub(1, ORD_SEQ);
    DropOutcome::Dropped
}

/*
    emergency flush
*/

/// Push a dirty, unpinned node's page out to a temporary block so the page
/// can be reclaimed under memory pressure. The identity survives; the next
/// `jload` pulls the content back in and releases the temporary block
pub fn emergency_flush(sb: &VolumeSuper, j: &JNodeRef) -> RuntimeResult<()> {
    if j.d_count() > 0 {
        return Err(Error::WouldBlock);
    }
    let pg = match jnode_lock_page(j) {
        Some(p) => p,
        None => return Err(Error::WouldBlock),
    };
    let res = (|| {
        if !pg.test(PG_UPTODATE) {
            return Err(Error::WouldBlock);
        }
        // clearing LOADED first closes the race against the lock-free
        // jload fast path: a loader either saw LOADED (and then our
        // d_count recheck sees its pin) or takes the slow path and waits
        // on the page lock we hold
        j.clear_state(JN_LOADED);
        if j.d_count() > 0 {
            j.set_state(JN_LOADED);
            return Err(Error::WouldBlock);
        }
        let target = sb.space().alloc_eflush_block()?;
        if let Err(e) = pg.write_to(&**sb.dev(), target) {
            sb.space().dealloc_eflush_block(target);
            j.set_state(JN_LOADED);
            return Err(e);
        }
        {
            let mut g = j.g.lock();
            g.eflush = Some(target);
        }
        j.set_state(JN_EFLUSH);
        pg.clear(PG_DIRTY);
        Ok(())
    })();
    if res.is_ok() {
        detach_page(sb, j, &pg);
    }
    pg.unlock();
    res
}

/// The eflush copy has been read back: release the temporary block
fn eflush_unflush(sb: &VolumeSuper, j: &JNodeRef) {
    let freed = {
        let mut g = j.g.lock();
        g.eflush.take()
    };
    if let Some(blk) = freed {
        j.clear_state(JN_EFLUSH);
        sb.space().dealloc_eflush_block(blk);
    }
}

/*
    debug invariants
*/

#[cfg(debug_assertions)]
pub fn jnode_invariant(j: &JNode) {
    // dirty => atom
    if j.is_dirty() {
        dbg_invariant!(j.g.lock().atom.is_some(), "dirty jnode without an atom");
    }
    // d_count <= x_count
    dbg_invariant!(j.d_count() <= j.x_count());
    // loaded => page bound
    if j.is_loaded() {
        dbg_invariant!(j.g.lock().page.is_some(), "loaded jnode without a page");
    }
    // queued-for-flush => part of a commit set
    if j.test(JN_FLUSH_QUEUED) {
        dbg_invariant!(j.test(JN_RELOC | JN_OVRWR | JN_HEARD_BANSHEE));
    }
    // reloc and ovrwr are mutually exclusive
    dbg_invariant!(!(j.test(JN_RELOC) && j.test(JN_OVRWR)));
}
