/*
 * Created on Sat Jan 13 2024
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

pub mod page;

use {
    super::{
        block::{BlockCount, BlockNr},
        error::{Error, RuntimeResult},
    },
    parking_lot::Mutex,
    std::{
        fs::{File, OpenOptions},
        io::{Read, Seek, SeekFrom, Write},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
};

/// Block size == page size. The master block records it and mount refuses a
/// mismatch
pub const BLOCK_SIZE: usize = 4096;

/// The device the volume lives on. One block per call; the engine does its
/// own caching above this
pub trait BlockDevice: Send + Sync + 'static {
    fn block_count(&self) -> BlockCount;
    fn read_block(&self, nr: BlockNr, buf: &mut [u8]) -> RuntimeResult<()>;
    fn write_block(&self, nr: BlockNr, buf: &[u8]) -> RuntimeResult<()>;
    /// Barrier: everything written before this call is durable when it
    /// returns
    fn sync(&self) -> RuntimeResult<()>;
}

pub type DeviceRef = Arc<dyn BlockDevice>;

fn check_range(dev: &impl BlockDevice, nr: BlockNr) -> RuntimeResult<u64> {
    if nr.is_fake() || nr.raw() >= dev.block_count() {
        return Err(Error::Corrupt);
    }
    Ok(nr.raw() * BLOCK_SIZE as u64)
}

/*
    file device
*/

/// A volume backed by a regular file (or a raw device node)
pub struct FileDevice {
    file: Mutex<File>,
    blocks: BlockCount,
}

impl FileDevice {
    pub fn create(path: &str, blocks: BlockCount) -> RuntimeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(blocks * BLOCK_SIZE as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            blocks,
        })
    }
    pub fn open(path: &str) -> RuntimeResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(Error::Corrupt);
        }
        Ok(Self {
            blocks: len / BLOCK_SIZE as u64,
            file: Mutex::new(file),
        })
    }
}

impl BlockDevice for FileDevice {
    fn block_count(&self) -> BlockCount {
        self.blocks
    }
    fn read_block(&self, nr: BlockNr, buf: &mut [u8]) -> RuntimeResult<()> {
        let off = check_range(self, nr)?;
        let mut f = self.file.lock();
        f.seek(SeekFrom::Start(off))?;
        f.read_exact(&mut buf[..BLOCK_SIZE])?;
        Ok(())
    }
    fn write_block(&self, nr: BlockNr, buf: &[u8]) -> RuntimeResult<()> {
        let off = check_range(self, nr)?;
        let mut f = self.file.lock();
        f.seek(SeekFrom::Start(off))?;
        f.write_all(&buf[..BLOCK_SIZE])?;
        Ok(())
    }
    fn sync(&self) -> RuntimeResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

/*
    memory device
*/

/// An in-memory volume. This is what the test-suite mounts; it can also take
/// point-in-time images so recovery tests can "crash" a volume and mount the
/// image
pub struct MemDevice {
    blocks: BlockCount,
    store: Mutex<Vec<u8>>,
    writes: AtomicU64,
    // fail every write once this many have gone through (0 = no cut)
    write_cut: AtomicU64,
}

impl MemDevice {
    pub fn new(blocks: BlockCount) -> Self {
        Self {
            blocks,
            store: Mutex::new(vec![0u8; blocks as usize * BLOCK_SIZE]),
            writes: AtomicU64::new(0),
            write_cut: AtomicU64::new(0),
        }
    }
    /// A deep copy of the current on-"disk" state
    pub fn image(&self) -> MemDevice {
        Self {
            blocks: self.blocks,
            store: Mutex::new(self.store.lock().clone()),
            writes: AtomicU64::new(0),
            write_cut: AtomicU64::new(0),
        }
    }
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
    /// Start failing writes after `n` more have succeeded
    pub fn cut_after(&self, n: u64) {
        self.write_cut
            .store(self.writes.load(Ordering::Relaxed) + n + 1, Ordering::Relaxed);
    }
}

impl BlockDevice for MemDevice {
    fn block_count(&self) -> BlockCount {
        self.blocks
    }
    fn read_block(&self, nr: BlockNr, buf: &mut [u8]) -> RuntimeResult<()> {
        let off = check_range(self, nr)? as usize;
        buf[..BLOCK_SIZE].copy_from_slice(&self.store.lock()[off..off + BLOCK_SIZE]);
        Ok(())
    }
    fn write_block(&self, nr: BlockNr, buf: &[u8]) -> RuntimeResult<()> {
        let off = check_range(self, nr)? as usize;
        let this_write = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        let cut = self.write_cut.load(Ordering::Relaxed);
        if cut != 0 && this_write >= cut {
            return Err(Error::Io(std::io::ErrorKind::Other));
        }
        self.store.lock()[off..off + BLOCK_SIZE].copy_from_slice(&buf[..BLOCK_SIZE]);
        Ok(())
    }
    fn sync(&self) -> RuntimeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::engine::block::BlockNr};

    #[test]
    fn memdev_roundtrip_and_cut() {
        let dev = MemDevice::new(8);
        let mut blk = vec![0u8; BLOCK_SIZE];
        blk[0] = 0xca;
        dev.write_block(BlockNr::new(3), &blk).unwrap();
        let mut out = vec![0u8; BLOCK_SIZE];
        dev.read_block(BlockNr::new(3), &mut out).unwrap();
        assert_eq!(out[0], 0xca);
        dev.cut_after(1);
        assert!(dev.write_block(BlockNr::new(4), &blk).is_ok());
        assert!(dev.write_block(BlockNr::new(5), &blk).is_err());
        // reads survive the cut
        dev.read_block(BlockNr::new(3), &mut out).unwrap();
    }

    #[test]
    fn fake_blocks_never_hit_the_device() {
        let dev = MemDevice::new(8);
        let blk = vec![0u8; BLOCK_SIZE];
        assert!(dev
            .write_block(BlockNr::fake_unallocated(1), &blk)
            .is_err());
    }
}
