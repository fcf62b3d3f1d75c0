/*
 * Created on Thu Jan 18 2024
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

//! Short-term lock ordering. Acquire strictly downward in this list and
//! release in reverse:
//!
//! page -> tree(w) -> tree(r) -> dk -> atom -> txnh -> jnode -> stack
//!
//! Debug builds track the ranks each thread currently holds and panic on an
//! out-of-order acquisition

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Rank {
    Page = 1,
    TreeWrite = 2,
    TreeRead = 3,
    Dk = 4,
    Atom = 5,
    Txnh = 6,
    Jnode = 7,
    Stack = 8,
}

#[cfg(debug_assertions)]
mod tracking {
    use super::Rank;
    crate::local! {
        static HELD: Vec<Rank> = Vec::new();
    }
    pub fn enter(rank: Rank) {
        crate::local_mut!(HELD, |held: &mut Vec<Rank>| {
            if let Some(top) = held.last() {
                // same-rank nesting is allowed only for jnode-level locks
                // taken one at a time in practice; everything else must
                // strictly descend
                debug_assert!(
                    *top <= rank,
                    "lock order violation: holding {:?}, acquiring {:?}",
                    top,
                    rank
                );
            }
            held.push(rank);
        })
    }
    pub fn exit(rank: Rank) {
        crate::local_mut!(HELD, |held: &mut Vec<Rank>| {
            if let Some(pos) = held.iter().rposition(|r| *r == rank) {
                held.remove(pos);
            }
        })
    }
}

/// RAII witness for a ranked lock acquisition. A no-op in release builds
pub struct RankGuard {
    #[cfg(debug_assertions)]
    rank: Rank,
}

pub fn enter(rank: Rank) -> RankGuard {
    #[cfg(debug_assertions)]
    {
        tracking::enter(rank);
        RankGuard { rank }
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = rank;
        RankGuard {}
    }
}

impl Drop for RankGuard {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        tracking::exit(self.rank);
    }
}
