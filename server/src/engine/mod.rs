/*
 * Created on Thu Jan 11 2024
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

#![allow(dead_code)]

#[macro_use]
mod macros;
pub mod alloc;
pub mod block;
pub mod cache;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod key;
pub mod lock;
pub mod plugin;
pub mod sb;
pub mod sync;
pub mod tree;
pub mod txn;
pub mod vdev;
pub mod wander;
pub mod znode;

#[cfg(test)]
mod tests;

pub use error::{Error, RuntimeResult};

/*

    A word on locks:

    Almost every structure in this engine is shared between threads that may
    block for disk I/O while holding long-term locks. The short-term locks
    (tree, dk, atom, jnode, lock-stack) follow a strict acquisition order
    which is documented in `lock::rank` and asserted in debug builds. If you
    add a lock, give it a rank.
*/
