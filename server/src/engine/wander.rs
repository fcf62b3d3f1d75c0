/*
 * Created on Wed Jan 24 2024
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

//! The wandering log. Overwrite-set blocks are first written to temporary
//! ("wandered") locations; a tx record maps home addresses to wandered
//! copies; pointing the journal header at the tx record is the commit
//! point. After the home locations are rewritten in place, the journal
//! footer catches up and the temporaries are released. Recovery replays the
//! newest committed-but-not-completed record by copying wandered copies
//! back home

use {
    super::{
        block::BlockNr,
        error::{Error, RuntimeResult},
        sb::{JOURNAL_FOOTER_BLOCK, JOURNAL_HEADER_BLOCK},
        vdev::{BlockDevice, DeviceRef, BLOCK_SIZE},
    },
    crc::{Crc, CRC_64_XZ},
    std::collections::BTreeMap,
};

const TX_HEAD_MAGIC: &[u8; 8] = b"SkyTxH01";
const TX_WMAP_MAGIC: &[u8; 8] = b"SkyTxW01";
const JRN_PTR_MAGIC: &[u8; 8] = b"SkyJrn01";

pub const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// (home, wandered) pairs one wander-map block carries
pub const ENTRIES_PER_WMAP_BLOCK: usize = (BLOCK_SIZE - 24) / 16;

/// Total blocks a tx record needs for `entries` map entries
pub fn tx_record_blocks(entries: usize) -> u64 {
    1 + entries.div_ceil(ENTRIES_PER_WMAP_BLOCK) as u64
}

fn put_crc(buf: &mut [u8]) {
    let crc = CRC64.checksum(&buf[..BLOCK_SIZE - 8]);
    buf[BLOCK_SIZE - 8..].copy_from_slice(&crc.to_le_bytes());
}

fn check_crc(buf: &[u8]) -> bool {
    let stored = u64::from_le_bytes(buf[BLOCK_SIZE - 8..].try_into().unwrap());
    CRC64.checksum(&buf[..BLOCK_SIZE - 8]) == stored
}

/*
    tx record
*/

/// Write the tx record for an atom into `blocks` (head first, then wander
/// map blocks) and flush it. Not yet the commit point
pub fn write_tx_record(
    dev: &dyn BlockDevice,
    atom_id: u64,
    wandered: &BTreeMap<u64, u64>,
    blocks: &[BlockNr],
    prev_head: u64,
) -> RuntimeResult<()> {
    dbg_invariant!(blocks.len() as u64 == tx_record_blocks(wandered.len()));
    let head = blocks[0];
    let wmap_blocks = &blocks[1..];
    // wander map blocks
    let mut entries = wandered.iter();
    for wb in wmap_blocks {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[0..8].copy_from_slice(TX_WMAP_MAGIC);
        let mut count = 0u64;
        let mut at = 24;
        while at + 16 <= BLOCK_SIZE - 8 {
            match entries.next() {
                Some((home, wandered_to)) => {
                    buf[at..at + 8].copy_from_slice(&home.to_le_bytes());
                    buf[at + 8..at + 16].copy_from_slice(&wandered_to.to_le_bytes());
                    at += 16;
                    count += 1;
                }
                None => break,
            }
        }
        buf[8..16].copy_from_slice(&count.to_le_bytes());
        put_crc(&mut buf);
        dev.write_block(*wb, &buf)?;
    }
    // head
    let mut buf = vec![0u8; BLOCK_SIZE];
    buf[0..8].copy_from_slice(TX_HEAD_MAGIC);
    buf[8..16].copy_from_slice(&atom_id.to_le_bytes());
    buf[16..24].copy_from_slice(&(wandered.len() as u64).to_le_bytes());
    buf[24..32].copy_from_slice(&(wmap_blocks.len() as u64).to_le_bytes());
    buf[32..40].copy_from_slice(&prev_head.to_le_bytes());
    let mut at = 40;
    for wb in wmap_blocks {
        buf[at..at + 8].copy_from_slice(&wb.raw().to_le_bytes());
        at += 8;
    }
    put_crc(&mut buf);
    dev.write_block(head, &buf)?;
    dev.sync()
}

/*
    journal pointer blocks
*/

fn write_ptr_block(dev: &dyn BlockDevice, at: BlockNr, target: u64) -> RuntimeResult<()> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    buf[0..8].copy_from_slice(JRN_PTR_MAGIC);
    buf[8..16].copy_from_slice(&target.to_le_bytes());
    put_crc(&mut buf);
    dev.write_block(at, &buf)?;
    dev.sync()
}

fn read_ptr_block(dev: &dyn BlockDevice, at: BlockNr) -> RuntimeResult<u64> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    dev.read_block(at, &mut buf)?;
    if &buf[0..8] != JRN_PTR_MAGIC || !check_crc(&buf) {
        return Err(Error::Corrupt);
    }
    Ok(u64::from_le_bytes(buf[8..16].try_into().unwrap()))
}

/// The commit point: the journal header now names this tx record
pub fn publish_commit(dev: &dyn BlockDevice, head: BlockNr) -> RuntimeResult<()> {
    write_ptr_block(dev, BlockNr::new(JOURNAL_HEADER_BLOCK), head.raw())
}

/// Write-back completed: the footer catches up with the header
pub fn complete_tx(dev: &dyn BlockDevice, head: BlockNr) -> RuntimeResult<()> {
    write_ptr_block(dev, BlockNr::new(JOURNAL_FOOTER_BLOCK), head.raw())
}

/// Fresh volume: both pointers name no record
pub fn init_journal(dev: &dyn BlockDevice) -> RuntimeResult<()> {
    write_ptr_block(dev, BlockNr::new(JOURNAL_HEADER_BLOCK), 0)?;
    write_ptr_block(dev, BlockNr::new(JOURNAL_FOOTER_BLOCK), 0)
}

/*
    recovery
*/

/// Mount-time journal replay against the raw device. Returns true if a
/// record was replayed
pub fn replay(dev: &DeviceRef) -> RuntimeResult<bool> {
    let header = read_ptr_block(&**dev, BlockNr::new(JOURNAL_HEADER_BLOCK))?;
    let footer = read_ptr_block(&**dev, BlockNr::new(JOURNAL_FOOTER_BLOCK))?;
    if header == 0 || header == footer {
        return Ok(false);
    }
    log::warn!(
        "journal: unfinished commit found (tx record at block {header}), replaying"
    );
    let mut head_buf = vec![0u8; BLOCK_SIZE];
    dev.read_block(BlockNr::new(header), &mut head_buf)?;
    if &head_buf[0..8] != TX_HEAD_MAGIC || !check_crc(&head_buf) {
        return Err(Error::Corrupt);
    }
    let total = u64::from_le_bytes(head_buf[16..24].try_into().unwrap());
    let nr_wmap = u64::from_le_bytes(head_buf[24..32].try_into().unwrap());
    let mut replayed = 0u64;
    let mut copy = vec![0u8; BLOCK_SIZE];
    for i in 0..nr_wmap {
        let at = 40 + (i as usize) * 8;
        let wb = BlockNr::decode(head_buf[at..at + 8].try_into().unwrap())?;
        let mut wmap_buf = vec![0u8; BLOCK_SIZE];
        dev.read_block(wb, &mut wmap_buf)?;
        if &wmap_buf[0..8] != TX_WMAP_MAGIC || !check_crc(&wmap_buf) {
            return Err(Error::Corrupt);
        }
        let count = u64::from_le_bytes(wmap_buf[8..16].try_into().unwrap());
        for e in 0..count as usize {
            let at = 24 + e * 16;
            let home = BlockNr::decode(wmap_buf[at..at + 8].try_into().unwrap())?;
            let wandered = BlockNr::decode(wmap_buf[at + 8..at + 16].try_into().unwrap())?;
            dev.read_block(wandered, &mut copy)?;
            dev.write_block(home, &copy)?;
            replayed += 1;
        }
    }
    if replayed != total {
        return Err(Error::Corrupt);
    }
    dev.sync()?;
    complete_tx(&**dev, BlockNr::new(header))?;
    log::info!("journal: replayed {replayed} blocks from tx record {header}");
    Ok(true)
}
