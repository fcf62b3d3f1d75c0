/*
 * Created on Tue Jan 30 2024
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

//! Seals: verifiable snapshots of a coord. A caller that must drop its
//! long-term lock seals the coord first; revalidating the seal later is a
//! version compare instead of a fresh tree descent

use {
    super::Coord,
    crate::engine::{
        block::BlockNr,
        cache::{jput, jref_lookup, JN_HEARD_BANSHEE},
        error::{Error, RuntimeResult},
        lock::{longterm_lock_znode, longterm_unlock_znode, LockHandle, LockMode, LockRequest, LockStack},
        sb::VolumeSuper,
    },
    std::sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seal {
    version: u64,
    block: BlockNr,
}

/// Snapshot the coord's node state. Valid while nothing edits the node
pub fn seal_init(coord: &Coord) -> Seal {
    Seal {
        version: coord.node.z().version(),
        block: coord.node.blocknr(),
    }
}

/// Re-lock the sealed node and confirm the coord still means what it meant.
/// A broken seal returns `Restart`: the caller redoes its search
pub fn seal_validate(
    sb: &VolumeSuper,
    stack: &Arc<LockStack>,
    seal: &Seal,
    coord: &Coord,
    mode: LockMode,
) -> RuntimeResult<LockHandle> {
    // the caller dropped its lock, so the node may be down to a cached
    // identity; take a handle reference before locking
    let node = match jref_lookup(&coord.node) {
        Some(n) => n,
        None => return Err(Error::Restart),
    };
    let h = match longterm_lock_znode(sb, stack, &node, mode, LockRequest::LOPRI) {
        Ok(h) => h,
        Err(e) => {
            jput(sb, &node);
            return Err(e);
        }
    };
    jput(sb, &node);
    let intact = !h.node.test(JN_HEARD_BANSHEE)
        && h.node.z().version() == seal.version
        && h.node.blocknr() == seal.block;
    if intact {
        Ok(h)
    } else {
        longterm_unlock_znode(sb, h);
        Err(Error::Restart)
    }
}
