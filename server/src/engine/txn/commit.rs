/*
 * Created on Thu Jan 25 2024
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

//! The commit pipeline. One atom at a time walks:
//!
//! 1. close capture (`CaptureWait`), drain other handles
//! 2. assign real locations to the relocate set, fix parent downlinks
//! 3. allocator pre-commit: commit bitmap catches up, superblock refreshed
//! 4. wandered copies of the overwrite set go to temporary blocks
//! 5. tx record written, journal header flips to it (the commit point)
//! 6. overwrite set rewritten in place, journal footer catches up
//! 7. temporaries released, captured nodes cleaned and released

use {
    super::{Atom, AtomStage},
    crate::engine::{
        alloc::{AllocHint, BlockStage, CommitHookData},
        block::BlockNr,
        cache::{
            attach_page, detach_page, jload, jnode_lock_page, jnode_set_block, jrelse, JNode,
            JNodeRef, JN_CREATED, JN_DIRTY, JN_FLUSH_QUEUED, JN_LOADED, JN_NEW, JN_OVRWR,
            JN_PARSED, JN_RELOC, JN_WRITEBACK,
        },
        error::{Error, RuntimeResult},
        sb::{VolumeSuper, FORMAT_SB_BLOCK},
        tree::edit,
        vdev::page::{MappingId, PG_DIRTY},
        wander,
    },
    std::sync::Arc,
};

cfg_test! {
    crate::local! {
        static CRASH_AFTER_COMMIT_RECORD: bool = false;
    }
    /// Test hook: stop the pipeline right after the commit point, before
    /// write-back, as if the machine died there
    pub fn debug_crash_after_commit_record(v: bool) {
        crate::local_mut!(CRASH_AFTER_COMMIT_RECORD, |c: &mut bool| *c = v)
    }
    fn crash_requested() -> bool {
        crate::local_ref!(CRASH_AFTER_COMMIT_RECORD, |c: &bool| *c)
    }
}

fn write_node_to(sb: &VolumeSuper, j: &JNodeRef, target: BlockNr) -> RuntimeResult<()> {
    jload(sb, j)?;
    let pg = match jnode_lock_page(j) {
        Some(p) => p,
        None => {
            jrelse(j);
            return Err(Error::Corrupt);
        }
    };
    let res = pg.write_to(&**sb.dev(), target);
    pg.unlock();
    jrelse(j);
    res
}

/// The format superblock travels through the commit like any other
/// overwrite member, carried by a transient io-head handle
fn sb_io_head(sb: &VolumeSuper) -> JNodeRef {
    let j = JNode::new_io_head(BlockNr::new(FORMAT_SB_BLOCK), sb.next_pg_index());
    let pg = sb.pages().find_or_create(MappingId::IoHead, j.pg_index());
    pg.lock();
    attach_page(&j, &pg);
    pg.fill(&sb.encode_format_block());
    pg.unlock();
    j.set_state(JN_LOADED | JN_PARSED);
    j
}

fn drop_io_head(sb: &VolumeSuper, j: &JNodeRef) {
    if let Some(pg) = jnode_lock_page(j) {
        detach_page(sb, j, &pg);
        pg.unlock();
    }
    j.clear_state(JN_LOADED);
}

/// Commit `atom`. `caller_is_member` says whether the calling thread holds
/// a handle bound to this atom (user commit) or not (daemon / forced)
pub fn commit_atom(sb: &VolumeSuper, atom: &Arc<Atom>, caller_is_member: bool) -> RuntimeResult<()> {
    let _commit = sb.txnmgr().commit_sema().lock();
    let atom = atom.resolve();
    {
        let mut inner = atom.lock();
        match inner.stage {
            AtomStage::Done | AtomStage::Fused => return Ok(()),
            AtomStage::Free | AtomStage::CaptureFuse => {
                inner.stage = AtomStage::CaptureWait;
            }
            _ => {}
        }
        drop(inner);
        atom.stage_cv.notify_all();
    }
    // drain other handles
    let floor = if caller_is_member { 1 } else { 0 };
    {
        let mut inner = atom.lock();
        while inner.txnh_count > floor {
            atom.stage_cv.wait(&mut inner);
        }
        inner.stage = AtomStage::PreCommit;
    }
    atom.stage_cv.notify_all();
    log::debug!("txn: atom {} entering commit", atom.id());
    match commit_pipeline(sb, &atom) {
        Ok(()) => Ok(()),
        Err(e) => {
            // fatal or not (a fatal cause additionally demotes the volume),
            // the atom rolls back
            abort_atom(sb, &atom, e);
            Err(e)
        }
    }
}

fn commit_pipeline(sb: &VolumeSuper, atom: &Arc<Atom>) -> RuntimeResult<()> {
    // snapshot the capture sets; capture into this atom is refused from
    // here on, so the lists are stable
    let (dirty, everyone) = {
        let inner = atom.lock();
        let mut dirty: Vec<JNodeRef> = Vec::new();
        for lvl in inner.dirty.iter() {
            dirty.extend(lvl.iter().cloned());
        }
        let mut everyone = dirty.clone();
        everyone.extend(inner.clean.iter().cloned());
        everyone.extend(inner.inodes.iter().cloned());
        everyone.extend(inner.ovrwr.iter().cloned());
        everyone.extend(inner.writeback.iter().cloned());
        (dirty, everyone)
    };
    if dirty.is_empty() && atom.lock().delete_set.is_empty() {
        // an atom that captured nothing dirty may still commit; it simply
        // releases its id
        finish_atom(sb, atom, &everyone);
        return Ok(());
    }
    // partition into relocate and overwrite sets
    let mut reloc: Vec<JNodeRef> = Vec::new();
    let mut ovrwr: Vec<JNodeRef> = Vec::new();
    for j in &dirty {
        j.set_state(JN_FLUSH_QUEUED);
        if j.blocknr().is_fake() || j.test(JN_CREATED) || j.test(JN_NEW) {
            j.set_state(JN_RELOC);
            reloc.push(j.clone());
        } else {
            j.set_state(JN_OVRWR);
            ovrwr.push(j.clone());
        }
    }
    // stage 2: real locations for the relocate set
    for j in &reloc {
        let hint = AllocHint {
            preferred: None,
            max_dist: None,
            level: if j.is_znode() { j.z().level() } else { 0 },
            stage: BlockStage::Unallocated,
            backward: false,
        };
        let (start, got) = sb.space().alloc_real(&hint, 1)?;
        dbg_invariant!(got == 1);
        jnode_set_block(sb, j, start);
        atom.lock().commit_allocs.push((start, 1));
        if j.is_znode() {
            edit::update_downlink(sb, j)?;
        }
    }
    // stage 3: allocator pre-commit + superblock refresh
    let bitmap_nodes = {
        let inner = atom.lock();
        let data = CommitHookData {
            allocs: &inner.commit_allocs,
            deletes: &inner.delete_set,
        };
        sb.space().pre_commit_hook(sb, &data)?
    };
    let mut items: Vec<JNodeRef> = Vec::new();
    items.extend(ovrwr.iter().cloned());
    items.extend(bitmap_nodes.iter().cloned());
    let sb_head = sb_io_head(sb);
    items.push(sb_head.clone());
    // stage 4: wandered copies. temporaries come straight out of the
    // working state
    let n_items = items.len() as u64;
    let n_tx = wander::tx_record_blocks(items.len());
    sb.space().grab_space(sb, n_items + n_tx, false)?;
    let mut temps: Vec<(BlockNr, u64)> = Vec::new();
    let res = (|| -> RuntimeResult<BlockNr> {
        let hint = AllocHint {
            stage: BlockStage::Grabbed,
            ..AllocHint::default()
        };
        for item in &items {
            let (target, got) = sb.space().alloc_real(&hint, 1)?;
            dbg_invariant!(got == 1);
            temps.push((target, 1));
            write_node_to(sb, item, target)?;
            atom.lock()
                .wandered
                .insert(item.blocknr().raw(), target.raw());
        }
        // the relocate set goes straight home, and must be on disk before
        // the commit record: after a crash the replay only restores the
        // overwrite set, which by then points at these blocks
        for j in &reloc {
            write_node_to(sb, j, j.blocknr())?;
        }
        // stage 5: tx record + commit point
        let mut tx_blocks = Vec::with_capacity(n_tx as usize);
        for _ in 0..n_tx {
            let (start, got) = sb.space().alloc_real(&hint, 1)?;
            dbg_invariant!(got == 1);
            temps.push((start, 1));
            tx_blocks.push(start);
        }
        let wmap = atom.lock().wandered.clone();
        wander::write_tx_record(&**sb.dev(), atom.id(), &wmap, &tx_blocks, sb.last_tx())?;
        wander::publish_commit(&**sb.dev(), tx_blocks[0])?;
        Ok(tx_blocks[0])
    })();
    let tx_head = match res {
        Ok(h) => h,
        Err(e) => {
            // not yet committed: the temporaries go straight back, and so
            // does the unconsumed slice of the reservation
            for (start, len) in &temps {
                sb.space().dealloc_real(*start, *len);
            }
            sb.space().ungrab(n_items + n_tx - temps.len() as u64);
            drop_io_head(sb, &sb_head);
            return Err(e);
        }
    };
    sb.set_last_tx(tx_head.raw());
    atom.set_stage(AtomStage::PostCommit);
    #[cfg(test)]
    {
        if crash_requested() {
            // the world ends here; the journal replay test mounts the
            // device image this state left behind
            return Ok(());
        }
    }
    // stage 6: deferred deallocations leave the working state now that the
    // record is stable; then write everything home
    let deleted: Vec<u64> = {
        let mut inner = atom.lock();
        let d: Vec<u64> = inner.delete_set.iter().copied().collect();
        inner.delete_set.clear();
        d
    };
    sb.space().post_commit_hook(sb, &deleted);
    for j in &items {
        j.set_state(JN_WRITEBACK);
        let res = write_node_to(sb, j, j.blocknr());
        j.clear_state(JN_WRITEBACK);
        res?;
    }
    sb.dev().sync()?;
    wander::complete_tx(&**sb.dev(), tx_head)?;
    // stage 7: release the temporaries and the capture set
    sb.space().post_write_back_hook(sb, &temps);
    drop_io_head(sb, &sb_head);
    finish_atom(sb, atom, &everyone);
    log::info!(
        "txn: atom {} committed ({} wandered, {} relocated)",
        atom.id(),
        items.len(),
        reloc.len()
    );
    Ok(())
}

/// Clean every captured node and retire the atom
fn finish_atom(sb: &VolumeSuper, atom: &Arc<Atom>, nodes: &[JNodeRef]) {
    {
        let mut inner = atom.lock();
        for lvl in inner.dirty.iter_mut() {
            lvl.clear();
        }
    }
    for j in nodes {
        {
            let mut g = j.guarded();
            g.atom = None;
        }
        j.clear_state(
            JN_DIRTY | JN_RELOC | JN_OVRWR | JN_FLUSH_QUEUED | JN_WRITEBACK | JN_CREATED | JN_NEW,
        );
        if let Some(pg) = j.page() {
            pg.clear(PG_DIRTY);
        }
    }
    {
        let mut inner = atom.lock();
        inner.clean.clear();
        inner.ovrwr.clear();
        inner.writeback.clear();
        inner.inodes.clear();
        inner.capture_count = 0;
        inner.stage = AtomStage::Done;
    }
    atom.stage_cv.notify_all();
    sb.txnmgr().retire(atom);
}

/// Roll the atom back: captured pages are cleaned (with an error mark on
/// fatal aborts) and the volume is demoted on fatal errors
fn abort_atom(sb: &VolumeSuper, atom: &Arc<Atom>, cause: Error) {
    log::error!("txn: atom {} aborted: {}", atom.id(), cause);
    let everyone = {
        let mut inner = atom.lock();
        let mut v = Atom::take_all_dirty(&mut inner);
        v.extend(inner.clean.iter().cloned());
        v.extend(inner.inodes.iter().cloned());
        v.extend(inner.ovrwr.iter().cloned());
        v.extend(inner.writeback.iter().cloned());
        inner.delete_set.clear();
        v
    };
    for j in &everyone {
        if let Some(pg) = j.page() {
            pg.clear(PG_DIRTY);
            if cause.is_fatal() {
                pg.set(crate::engine::vdev::page::PG_ERROR);
            }
        }
    }
    finish_atom(sb, atom, &everyone);
    if cause.is_fatal() {
        sb.demote_readonly(cause);
    }
}
