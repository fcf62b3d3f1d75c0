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

use {core::fmt, std::io};

pub type RuntimeResult<T> = Result<T, Error>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
/// The engine error taxonomy. Everything fallible in the engine returns one
/// of these; only [`Error::Restart`] and [`Error::WouldDeadlock`] are
/// recovered internally (at the traversal level), the rest surface to the
/// caller unchanged
pub enum Error {
    // surfaced to the caller
    /// key/object absent
    NotFound,
    /// duplicate insertion
    Exists,
    /// a non-blocking caller ran into contention
    WouldBlock,
    /// allocation failure
    NoMemory,
    /// the allocator cannot satisfy the reservation
    NoSpace,
    /// disk error during read/write. aborts the current atom and demotes
    /// the volume to read-only
    Io(io::ErrorKind),
    /// parse failure, impossible block number or a bad checksum. aborts the
    /// atom; reported to the caller as an I/O failure
    Corrupt,
    // recovered internally
    /// this low-priority lock stack was signalled; release everything and
    /// restart the operation
    WouldDeadlock,
    /// the search coord was invalidated under us (dk moved, node died)
    Restart,
    /// the target node is being killed
    Dying,
}

impl Error {
    /// A fatal error forces an atom abort and demotes the volume
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Corrupt)
    }
    /// Errors that the topmost traversal loop absorbs by restarting
    pub const fn is_traversal_restart(&self) -> bool {
        matches!(self, Error::Restart | Error::WouldDeadlock)
    }
    /// What the caller across the engine boundary sees
    pub const fn external(self) -> Self {
        match self {
            Error::Corrupt => Error::Io(io::ErrorKind::InvalidData),
            e => e,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Exists => write!(f, "already exists"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::NoMemory => write!(f, "out of memory"),
            Error::NoSpace => write!(f, "out of space"),
            Error::Io(kind) => write!(f, "i/o error: {kind}"),
            Error::Corrupt => write!(f, "on-disk corruption detected"),
            Error::WouldDeadlock => write!(f, "lock request would deadlock"),
            Error::Restart => write!(f, "traversal restart required"),
            Error::Dying => write!(f, "node is being killed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}
