/*
 * Created on Thu Feb 01 2024
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

//! The volume super: every piece of per-volume mutable state lives behind
//! this handle (tree, caches, transaction manager, space accounting,
//! object ids, read-only demotion). Nothing in the engine is process-wide.
//!
//! On-disk geometry (block numbers, fixed):
//!
//! ```text
//! 16: master  17: format sb  18: journal header  19: journal footer
//! 20: status  21..: bitmap blocks, then the initial root
//! ```

use {
    super::{
        alloc::{bitmap::{bitmap_blocks_for, BitmapAllocator}, SpaceManager},
        block::BlockNr,
        config::Tunables,
        daemon::Entd,
        error::{Error, RuntimeResult},
        plugin::{self, PluginDict, PluginType},
        sync::{ORD_ACQ, ORD_REL, ORD_RLX},
        tree::{node::{NodeOps, LAYOUT40}, Tree},
        txn::TxnMgr,
        vdev::{page::PageCache, BlockDevice, DeviceRef, BLOCK_SIZE},
        wander,
        znode::create_uber,
    },
    crate::util::os,
    core::sync::atomic::{AtomicBool, AtomicU64},
    crc::{Crc, CRC_64_XZ},
    parking_lot::Mutex,
    std::sync::Arc,
    uuid::Uuid,
};

pub const MASTER_BLOCK: u64 = 16;
pub const FORMAT_SB_BLOCK: u64 = 17;
pub const JOURNAL_HEADER_BLOCK: u64 = 18;
pub const JOURNAL_FOOTER_BLOCK: u64 = 19;
pub const STATUS_BLOCK: u64 = 20;
pub const BITMAP_START_BLOCK: u64 = 21;

/// Checked by prefix, the historic way
const MASTER_MAGIC: &[u8; 7] = b"ReIsEr4";
const FORMAT_MAGIC: &[u8; 8] = b"SkyFmt40";
const STATUS_MAGIC: &[u8; 8] = b"SkySt001";

const FORMAT_FLAG_LARGE_KEYS: u64 = 1 << 0;

/// First object id handed out to user objects; the low range is reserved
const FIRST_DYNAMIC_OID: u64 = 1 << 16;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VolumeStatus {
    Ok = 0,
    Corrupt = 1,
    IoDegraded = 2,
}

/*
    the super handle
*/

pub struct VolumeSuper {
    dev: DeviceRef,
    pages: PageCache,
    tree: Tree,
    txnmgr: TxnMgr,
    space: SpaceManager,
    tunables: Tunables,
    pdict: PluginDict,
    // identity
    uuid: Uuid,
    label: [u8; 16],
    mkfs_id: u32,
    block_count: u64,
    large_keys: bool,
    // object ids (the oid40 shape: smallest free oid + live file count)
    next_oid: AtomicU64,
    file_count: AtomicU64,
    // in-memory sequences
    fake_seq: AtomicU64,
    pg_seq: AtomicU64,
    last_tx: AtomicU64,
    readonly: AtomicBool,
    entd: Mutex<Option<Entd>>,
}

impl VolumeSuper {
    pub fn dev(&self) -> &DeviceRef {
        &self.dev
    }
    pub fn pages(&self) -> &PageCache {
        &self.pages
    }
    pub fn tree(&self) -> &Tree {
        &self.tree
    }
    pub fn txnmgr(&self) -> &TxnMgr {
        &self.txnmgr
    }
    pub fn space(&self) -> &SpaceManager {
        &self.space
    }
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }
    pub fn plugin_dict(&self) -> &PluginDict {
        &self.pdict
    }
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
    pub fn block_count(&self) -> u64 {
        self.block_count
    }
    pub fn large_keys(&self) -> bool {
        self.large_keys
    }
    pub fn bitmap_block(&self, index: u64) -> BlockNr {
        BlockNr::new(BITMAP_START_BLOCK + index)
    }
    pub fn first_data_block(&self) -> u64 {
        BITMAP_START_BLOCK + bitmap_blocks_for(self.block_count)
    }
    pub fn next_fake_block(&self) -> BlockNr {
        BlockNr::fake_unallocated(self.fake_seq.fetch_add(1, ORD_RLX))
    }
    pub fn next_pg_index(&self) -> u64 {
        self.pg_seq.fetch_add(1, ORD_RLX)
    }
    pub fn last_tx(&self) -> u64 {
        self.last_tx.load(ORD_ACQ)
    }
    pub fn set_last_tx(&self, tx: u64) {
        self.last_tx.store(tx, ORD_REL);
    }
    // oids
    pub fn oid_allocate(&self) -> u64 {
        self.file_count.fetch_add(1, ORD_RLX);
        self.next_oid.fetch_add(1, ORD_RLX)
    }
    pub fn oid_release(&self, _oid: u64) {
        self.file_count.fetch_sub(1, ORD_RLX);
    }
    pub fn file_count(&self) -> u64 {
        self.file_count.load(ORD_RLX)
    }
    // read-only demotion
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(ORD_ACQ)
    }
    pub fn check_writable(&self) -> RuntimeResult<()> {
        if self.is_readonly() {
            Err(Error::Io(std::io::ErrorKind::PermissionDenied))
        } else {
            Ok(())
        }
    }
    /// A fatal error happened: the volume goes read-only for the rest of
    /// this mount and the status block records why
    pub fn demote_readonly(&self, cause: Error) {
        if self.readonly.swap(true, ORD_ACQ) {
            return;
        }
        log::error!("volume demoted to read-only: {cause}");
        let status = match cause {
            Error::Corrupt => VolumeStatus::Corrupt,
            _ => VolumeStatus::IoDegraded,
        };
        if let Err(e) = write_status(&*self.dev, status) {
            log::error!("status block write failed during demotion: {e}");
        }
    }
    /// The format superblock as the next commit will persist it
    pub fn encode_format_block(&self) -> Vec<u8> {
        let (root, height) = self.tree.root_info();
        let c = self.space.counters();
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[0..8].copy_from_slice(FORMAT_MAGIC);
        buf[8..16].copy_from_slice(&self.block_count.to_le_bytes());
        buf[16..24].copy_from_slice(&c.free_committed.to_le_bytes());
        buf[24..32].copy_from_slice(&root.raw().to_le_bytes());
        buf[32..34].copy_from_slice(&(height as u16).to_le_bytes());
        buf[34..36].copy_from_slice(&0u16.to_le_bytes()); // tail policy
        buf[36..40].copy_from_slice(&self.mkfs_id.to_le_bytes());
        buf[40..48].copy_from_slice(&self.next_oid.load(ORD_RLX).to_le_bytes());
        buf[48..56].copy_from_slice(&self.file_count.load(ORD_RLX).to_le_bytes());
        let flags = if self.large_keys {
            FORMAT_FLAG_LARGE_KEYS
        } else {
            0
        };
        buf[56..64].copy_from_slice(&flags.to_le_bytes());
        let crc = CRC64.checksum(&buf[..BLOCK_SIZE - 8]);
        buf[BLOCK_SIZE - 8..].copy_from_slice(&crc.to_le_bytes());
        buf
    }
    // daemon
    pub fn start_daemon(self: &Arc<Self>) {
        let mut slot = self.entd.lock();
        if slot.is_none() {
            *slot = Some(Entd::start(self));
        }
    }
    pub fn stop_daemon(&self) {
        if let Some(entd) = self.entd.lock().take() {
            entd.stop();
        }
    }
}

/*
    status block
*/

fn write_status(dev: &dyn BlockDevice, status: VolumeStatus) -> RuntimeResult<()> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    buf[0..8].copy_from_slice(STATUS_MAGIC);
    buf[8..12].copy_from_slice(&(status as u32).to_le_bytes());
    let crc = CRC64.checksum(&buf[..BLOCK_SIZE - 8]);
    buf[BLOCK_SIZE - 8..].copy_from_slice(&crc.to_le_bytes());
    dev.write_block(BlockNr::new(STATUS_BLOCK), &buf)?;
    dev.sync()
}

pub fn read_status(dev: &dyn BlockDevice) -> RuntimeResult<VolumeStatus> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    dev.read_block(BlockNr::new(STATUS_BLOCK), &mut buf)?;
    if &buf[0..8] != STATUS_MAGIC {
        return Err(Error::Corrupt);
    }
    let stored = u64::from_le_bytes(buf[BLOCK_SIZE - 8..].try_into().unwrap());
    if CRC64.checksum(&buf[..BLOCK_SIZE - 8]) != stored {
        return Err(Error::Corrupt);
    }
    match u32::from_le_bytes(buf[8..12].try_into().unwrap()) {
        0 => Ok(VolumeStatus::Ok),
        1 => Ok(VolumeStatus::Corrupt),
        2 => Ok(VolumeStatus::IoDegraded),
        _ => Err(Error::Corrupt),
    }
}

/*
    mkfs
*/

pub struct MkfsOpts {
    pub label: Option<String>,
    pub large_keys: bool,
}

/// Write a fresh volume: master block, empty journal, bitmaps covering the
/// reserved area, and an empty leaf as the root
pub fn mkfs(dev: &DeviceRef, opts: MkfsOpts) -> RuntimeResult<Uuid> {
    let blocks = dev.block_count();
    let nr_bmap = bitmap_blocks_for(blocks);
    let first_data = BITMAP_START_BLOCK + nr_bmap;
    if blocks < first_data + 8 {
        return Err(Error::NoSpace);
    }
    let uuid = Uuid::new_v4();
    let mkfs_id: u32 = uuid.as_u128() as u32;
    // master
    let mut master = vec![0u8; BLOCK_SIZE];
    master[0..7].copy_from_slice(MASTER_MAGIC);
    master[8..10].copy_from_slice(&(BLOCK_SIZE as u16).to_le_bytes());
    let fmt_id = plugin::lookup(PluginType::DiskFormat, 0)?.id;
    master[10..12].copy_from_slice(&fmt_id.to_le_bytes());
    master[12..28].copy_from_slice(uuid.as_bytes());
    if let Some(label) = &opts.label {
        let bytes = label.as_bytes();
        master[28..28 + bytes.len().min(16)].copy_from_slice(&bytes[..bytes.len().min(16)]);
    }
    // diskmap pointer: none
    master[44..52].copy_from_slice(&0u64.to_le_bytes());
    dev.write_block(BlockNr::new(MASTER_BLOCK), &master)?;
    // journal + status
    wander::init_journal(&**dev)?;
    write_status(&**dev, VolumeStatus::Ok)?;
    // bitmaps: everything up to and including the root block is taken
    let used_until = first_data; // inclusive: root sits at first_data
    let mut written = 0u64;
    for i in 0..nr_bmap {
        let mut bmap = vec![0u8; BLOCK_SIZE];
        let base = i * super::alloc::bitmap::BITS_PER_BLOCK;
        for bit in 0..super::alloc::bitmap::BITS_PER_BLOCK {
            let blk = base + bit;
            if blk > used_until {
                break;
            }
            bmap[(bit / 8) as usize] |= 1 << (bit % 8);
            written += 1;
        }
        dev.write_block(BlockNr::new(BITMAP_START_BLOCK + i), &bmap)?;
    }
    // the root: an empty leaf
    let mut root = vec![0u8; BLOCK_SIZE];
    LAYOUT40.init(&mut root, 1, opts.large_keys);
    dev.write_block(BlockNr::new(first_data), &root)?;
    // format superblock
    let free = blocks - written;
    let mut fmt = vec![0u8; BLOCK_SIZE];
    fmt[0..8].copy_from_slice(FORMAT_MAGIC);
    fmt[8..16].copy_from_slice(&blocks.to_le_bytes());
    fmt[16..24].copy_from_slice(&free.to_le_bytes());
    fmt[24..32].copy_from_slice(&first_data.to_le_bytes());
    fmt[32..34].copy_from_slice(&1u16.to_le_bytes());
    fmt[34..36].copy_from_slice(&0u16.to_le_bytes());
    fmt[36..40].copy_from_slice(&mkfs_id.to_le_bytes());
    fmt[40..48].copy_from_slice(&FIRST_DYNAMIC_OID.to_le_bytes());
    fmt[48..56].copy_from_slice(&0u64.to_le_bytes());
    let flags = if opts.large_keys {
        FORMAT_FLAG_LARGE_KEYS
    } else {
        0
    };
    fmt[56..64].copy_from_slice(&flags.to_le_bytes());
    let crc = CRC64.checksum(&fmt[..BLOCK_SIZE - 8]);
    fmt[BLOCK_SIZE - 8..].copy_from_slice(&crc.to_le_bytes());
    dev.write_block(BlockNr::new(FORMAT_SB_BLOCK), &fmt)?;
    dev.sync()?;
    log::info!(
        "mkfs: {} blocks, {} free, uuid {} (created {})",
        blocks,
        free,
        uuid,
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    );
    Ok(uuid)
}

/*
    mount / unmount
*/

pub fn mount(dev: DeviceRef, tunables: Tunables) -> RuntimeResult<Arc<VolumeSuper>> {
    // master block sanity
    let mut master = vec![0u8; BLOCK_SIZE];
    dev.read_block(BlockNr::new(MASTER_BLOCK), &mut master)?;
    if &master[0..7] != MASTER_MAGIC {
        return Err(Error::Corrupt);
    }
    let blocksize = u16::from_le_bytes(master[8..10].try_into().unwrap());
    if blocksize as usize != BLOCK_SIZE {
        log::error!("volume block size {blocksize} does not match the page size");
        return Err(Error::Corrupt);
    }
    let pdict = PluginDict::identity();
    let fmt_disk_id = u16::from_le_bytes(master[10..12].try_into().unwrap());
    pdict.translate(PluginType::DiskFormat, fmt_disk_id)?;
    let uuid = Uuid::from_slice(&master[12..28]).map_err(|_| Error::Corrupt)?;
    let mut label = [0u8; 16];
    label.copy_from_slice(&master[28..44]);
    // replay an interrupted commit before trusting anything else
    wander::replay(&dev)?;
    // format superblock
    let mut fmt = vec![0u8; BLOCK_SIZE];
    dev.read_block(BlockNr::new(FORMAT_SB_BLOCK), &mut fmt)?;
    if &fmt[0..8] != FORMAT_MAGIC {
        return Err(Error::Corrupt);
    }
    let stored = u64::from_le_bytes(fmt[BLOCK_SIZE - 8..].try_into().unwrap());
    if CRC64.checksum(&fmt[..BLOCK_SIZE - 8]) != stored {
        return Err(Error::Corrupt);
    }
    let block_count = u64::from_le_bytes(fmt[8..16].try_into().unwrap());
    let free_blocks = u64::from_le_bytes(fmt[16..24].try_into().unwrap());
    let root_block = BlockNr::decode(fmt[24..32].try_into().unwrap())?;
    let height = u16::from_le_bytes(fmt[32..34].try_into().unwrap()) as u8;
    let mkfs_id = u32::from_le_bytes(fmt[36..40].try_into().unwrap());
    let next_oid = u64::from_le_bytes(fmt[40..48].try_into().unwrap());
    let file_count = u64::from_le_bytes(fmt[48..56].try_into().unwrap());
    let flags = u64::from_le_bytes(fmt[56..64].try_into().unwrap());
    let large_keys = flags & FORMAT_FLAG_LARGE_KEYS != 0;
    if block_count != dev.block_count() || height == 0 {
        return Err(Error::Corrupt);
    }
    if large_keys != tunables.large_keys {
        log::warn!("key-width tunable ignored: the volume decides");
    }
    // hash table sized off free memory, halving until it fits
    let buckets = super::cache::table::JTable::size_for_memory(os::free_memory_in_bytes());
    let sb = Arc::new(VolumeSuper {
        dev,
        pages: PageCache::new(),
        tree: Tree::new(buckets, tunables.cbk_cache_slots),
        txnmgr: TxnMgr::new(),
        space: SpaceManager::new(),
        tunables,
        pdict,
        uuid,
        label,
        mkfs_id,
        block_count,
        large_keys,
        next_oid: AtomicU64::new(next_oid.max(FIRST_DYNAMIC_OID)),
        file_count: AtomicU64::new(file_count),
        fake_seq: AtomicU64::new(1),
        pg_seq: AtomicU64::new(1),
        last_tx: AtomicU64::new(0),
        readonly: AtomicBool::new(false),
        entd: Mutex::new(None),
    });
    sb.tree.set_root(root_block, height);
    let uber = create_uber(&sb, height)?;
    sb.tree.set_uber(uber);
    let (allocator, observed_free) = BitmapAllocator::load(&sb, block_count)?;
    if observed_free != free_blocks {
        log::warn!(
            "free-block count disagrees with the bitmaps ({} vs {}); trusting the bitmaps",
            free_blocks,
            observed_free
        );
    }
    sb.space.install(Box::new(allocator), observed_free);
    match read_status(&*sb.dev) {
        Ok(VolumeStatus::Ok) => {}
        Ok(s) => log::warn!("volume was previously degraded ({s:?})"),
        Err(_) => log::warn!("status block unreadable; continuing"),
    }
    write_status(&*sb.dev, VolumeStatus::Ok)?;
    log::info!(
        "mounted volume {} ({} blocks, {} free, height {}, {} buckets)",
        uuid,
        block_count,
        observed_free,
        height,
        buckets
    );
    Ok(sb)
}

/// Push everything out and detach. The volume is clean afterwards
pub fn unmount(sb: &Arc<VolumeSuper>) -> RuntimeResult<()> {
    sb.stop_daemon();
    if !sb.is_readonly() {
        super::txn::force_commit_all(sb)?;
    }
    sb.dev.sync()?;
    sb.tree.clear_uber();
    log::info!("unmounted volume {}", sb.uuid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::engine::vdev::MemDevice,
    };

    fn memdev(blocks: u64) -> DeviceRef {
        Arc::new(MemDevice::new(blocks))
    }

    #[test]
    fn mkfs_then_mount() {
        let dev = memdev(1024);
        let uuid = mkfs(
            &dev,
            MkfsOpts {
                label: Some("testvol".into()),
                large_keys: false,
            },
        )
        .unwrap();
        let sb = mount(dev, Tunables::default()).unwrap();
        assert_eq!(sb.uuid(), uuid);
        assert_eq!(sb.block_count(), 1024);
        assert!(!sb.large_keys());
        let (root, height) = sb.tree().root_info();
        assert_eq!(height, 1);
        assert_eq!(root.raw(), sb.first_data_block());
        assert!(sb.space().free_blocks() > 0);
        unmount(&sb).unwrap();
    }

    #[test]
    fn mount_refuses_garbage() {
        let dev = memdev(128);
        assert!(matches!(
            mount(dev, Tunables::default()),
            Err(Error::Corrupt)
        ));
    }

    #[test]
    fn status_block_roundtrip() {
        let dev = memdev(64);
        write_status(&*dev, VolumeStatus::Corrupt).unwrap();
        assert_eq!(read_status(&*dev).unwrap(), VolumeStatus::Corrupt);
    }
}
