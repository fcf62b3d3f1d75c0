/*
 * Created on Sun Jan 14 2024
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

//! The node-handle hash table. Lookups are epoch-protected and lock-free;
//! every mutation happens under the tree write-lock (single writer), which
//! is why the bucket lists get away with plain release stores. Unlinked
//! bucket nodes are retired through the epoch GC so a concurrent reader
//! either sees the intact handle or a cleanly-gone one

use {
    super::{JKey, JNode},
    crate::engine::sync::{cpin, Atomic, Guard, Owned, Shared, ORD_ACQ, ORD_REL, ORD_RLX},
    std::sync::Arc,
};

struct BucketNode {
    key: JKey,
    j: Arc<JNode>,
    next: Atomic<BucketNode>,
}

pub struct JTable {
    buckets: Box<[Atomic<BucketNode>]>,
    mask: u64,
}

impl JTable {
    /// Table with `n` buckets; `n` is rounded up to a power of two and never
    /// below one (a single-bucket table is legal, everything collides)
    pub fn with_buckets(n: usize) -> Self {
        let n = n.max(1).next_power_of_two();
        let mut buckets = Vec::with_capacity(n);
        buckets.resize_with(n, Atomic::null);
        Self {
            buckets: buckets.into_boxed_slice(),
            mask: (n - 1) as u64,
        }
    }
    /// Derive a bucket count from the free memory available at mount,
    /// halving until it fits
    pub fn size_for_memory(mut free_bytes: u64) -> usize {
        const PER_BUCKET: u64 = sizeof!(Atomic<BucketNode>) as u64;
        const FRACTION: u64 = 1 << 12;
        const MAX_BUCKETS: u64 = 1 << 20;
        if free_bytes == 0 {
            // unknown; a modest default
            return 1 << 12;
        }
        free_bytes /= FRACTION;
        let mut buckets = (free_bytes / PER_BUCKET).min(MAX_BUCKETS);
        while buckets > 1 && !buckets.is_power_of_two() {
            buckets /= 2;
        }
        buckets.max(1) as usize
    }
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
    fn bucket_of(&self, key: &JKey) -> &Atomic<BucketNode> {
        &self.buckets[(key.bucket_seed() & self.mask) as usize]
    }
    /// Lock-free lookup. The caller decides what reference semantics to
    /// apply to the returned handle (see `jref`)
    pub fn lookup(&self, key: &JKey) -> Option<Arc<JNode>> {
        let g = cpin();
        self.lookup_pinned(key, &g)
    }
    fn lookup_pinned(&self, key: &JKey, g: &Guard) -> Option<Arc<JNode>> {
        let mut cur = self.bucket_of(key).load(ORD_ACQ, g);
        while let Some(node) = unsafe {
            // UNSAFE(@ohsayan): epoch-pinned; unlinked nodes are retired,
            // not freed, until the guard goes away
            cur.as_ref()
        } {
            if node.key == *key {
                return Some(node.j.clone());
            }
            cur = node.next.load(ORD_ACQ, g);
        }
        None
    }
    /// Insert a handle. Caller must hold the tree write-lock and must have
    /// verified the key is absent
    pub fn insert(&self, key: JKey, j: Arc<JNode>) {
        let g = cpin();
        let bucket = self.bucket_of(&key);
        let head = bucket.load(ORD_RLX, &g);
        let node = Owned::new(BucketNode {
            key,
            j,
            next: Atomic::null(),
        });
        node.next.store(head, ORD_RLX);
        bucket.store(node, ORD_REL);
    }
    /// Unlink a handle. Caller must hold the tree write-lock. Returns the
    /// handle if it was present
    pub fn remove(&self, key: &JKey) -> Option<Arc<JNode>> {
        let g = cpin();
        let bucket = self.bucket_of(key);
        let mut prev: Option<Shared<BucketNode>> = None;
        let mut cur = bucket.load(ORD_ACQ, &g);
        loop {
            let node = unsafe {
                // UNSAFE(@ohsayan): epoch-pinned + tree write-lock held
                cur.as_ref()
            }?;
            if node.key == *key {
                let next = node.next.load(ORD_RLX, &g);
                match prev {
                    Some(p) => unsafe {
                        // UNSAFE(@ohsayan): single writer under the tree
                        // write-lock; p is still linked
                        p.deref().next.store(next, ORD_REL)
                    },
                    None => bucket.store(next, ORD_REL),
                }
                let j = node.j.clone();
                unsafe {
                    // UNSAFE(@ohsayan): node is now unreachable from the
                    // bucket; readers inside the grace period keep it alive
                    g.defer_destroy(cur)
                }
                return Some(j);
            }
            prev = Some(cur);
            cur = node.next.load(ORD_ACQ, &g);
        }
    }
    /// Re-key a handle in place (block-number change on relocation). Tree
    /// write-lock required
    pub fn rehash(&self, old: &JKey, new: JKey) -> bool {
        match self.remove(old) {
            Some(j) => {
                self.insert(new, j);
                true
            }
            None => false,
        }
    }
    /// Snapshot of every resident handle. Tree lock (read or write) must be
    /// held to keep the walk stable
    pub fn iter_all(&self) -> Vec<Arc<JNode>> {
        let g = cpin();
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            let mut cur = bucket.load(ORD_ACQ, &g);
            while let Some(node) = unsafe {
                // UNSAFE(@ohsayan): epoch-pinned
                cur.as_ref()
            } {
                out.push(node.j.clone());
                cur = node.next.load(ORD_ACQ, &g);
            }
        }
        out
    }
}

impl Drop for JTable {
    fn drop(&mut self) {
        let g = cpin();
        for bucket in self.buckets.iter() {
            let mut cur = bucket.swap(Shared::null(), ORD_ACQ, &g);
            while !cur.is_null() {
                let next = unsafe {
                    // UNSAFE(@ohsayan): we own the table exclusively in drop
                    cur.deref().next.load(ORD_RLX, &g)
                };
                unsafe {
                    // UNSAFE(@ohsayan): unreachable now
                    g.defer_destroy(cur);
                }
                cur = next;
            }
        }
    }
}
