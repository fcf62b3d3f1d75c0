/*
 * Created on Wed Jan 31 2024
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

//! The plugin registry. Plugins are identified by `(type, id)`; disk ids
//! found in on-disk structures are translated through a per-volume
//! dictionary into registry indices at mount, so a future format can
//! renumber without touching the engine

use {
    super::error::{Error, RuntimeResult},
    std::collections::HashMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PluginType {
    NodeLayout = 0,
    Item = 1,
    SpaceAllocator = 2,
    DiskFormat = 3,
    Oid = 4,
}

/// Registry row: one compiled-in plugin
pub struct PluginHeader {
    pub typ: PluginType,
    pub id: u16,
    pub name: &'static str,
}

/// Everything compiled into this build
pub static PLUGIN_REGISTRY: &[PluginHeader] = &[
    PluginHeader {
        typ: PluginType::NodeLayout,
        id: 0,
        name: "layout40",
    },
    PluginHeader {
        typ: PluginType::Item,
        id: 0,
        name: "statdata",
    },
    PluginHeader {
        typ: PluginType::Item,
        id: 1,
        name: "internal",
    },
    PluginHeader {
        typ: PluginType::Item,
        id: 2,
        name: "extent",
    },
    PluginHeader {
        typ: PluginType::SpaceAllocator,
        id: 0,
        name: "bitmap",
    },
    PluginHeader {
        typ: PluginType::DiskFormat,
        id: 0,
        name: "format40",
    },
    PluginHeader {
        typ: PluginType::Oid,
        id: 0,
        name: "oid40",
    },
];

pub fn lookup(typ: PluginType, id: u16) -> RuntimeResult<&'static PluginHeader> {
    PLUGIN_REGISTRY
        .iter()
        .find(|h| h.typ == typ && h.id == id)
        .ok_or(Error::Corrupt)
}

/// Per-volume translation of on-disk plugin ids to registry ids, built at
/// mount. The shipped formats use identity mappings; the dictionary is the
/// seam where a conversion would live
pub struct PluginDict {
    map: HashMap<(PluginType, u16), u16>,
}

impl PluginDict {
    /// Identity dictionary over the registry, validating that every id the
    /// volume may reference actually exists in this build
    pub fn identity() -> Self {
        let mut map = HashMap::new();
        for h in PLUGIN_REGISTRY {
            map.insert((h.typ, h.id), h.id);
        }
        Self { map }
    }
    pub fn translate(&self, typ: PluginType, disk_id: u16) -> RuntimeResult<u16> {
        self.map.get(&(typ, disk_id)).copied().ok_or(Error::Corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolution() {
        assert_eq!(lookup(PluginType::NodeLayout, 0).unwrap().name, "layout40");
        assert!(lookup(PluginType::NodeLayout, 9).is_err());
        let dict = PluginDict::identity();
        assert_eq!(dict.translate(PluginType::Item, 2).unwrap(), 2);
        assert!(dict.translate(PluginType::Item, 77).is_err());
    }
}
