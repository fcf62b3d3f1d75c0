/*
 * Created on Tue Feb 06 2024
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

//! End-to-end scenarios over in-memory volumes

mod cache;
mod locking;
mod recovery;
mod tree;
mod txn;

use {
    super::{
        config::Tunables,
        key::{Key, KeyType},
        sb::{self, MkfsOpts, VolumeSuper},
        vdev::{DeviceRef, MemDevice},
    },
    std::sync::Arc,
};

/// Fresh volume on an in-memory device. The device handle is returned too
/// so tests can image it ("crash") and remount
pub(self) fn fresh_volume(blocks: u64) -> (Arc<MemDevice>, Arc<VolumeSuper>) {
    let mem = Arc::new(MemDevice::new(blocks));
    let dev: DeviceRef = mem.clone();
    sb::mkfs(
        &dev,
        MkfsOpts {
            label: None,
            large_keys: false,
        },
    )
    .unwrap();
    let sup = sb::mount(dev, Tunables::default()).unwrap();
    (mem, sup)
}

pub(self) fn remount(mem: &Arc<MemDevice>) -> Arc<VolumeSuper> {
    let image: DeviceRef = Arc::new(mem.image());
    sb::mount(image, Tunables::default()).unwrap()
}

pub(self) fn sd_key(oid: u64) -> Key {
    Key::build(oid, KeyType::StatData, oid, 0)
}

pub(self) fn body_key(oid: u64, offset: u64) -> Key {
    Key::build(oid, KeyType::FileBody, oid, offset)
}
