/*
 * Created on Fri Feb 02 2024
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

//! The background daemon: commits atoms that aged out or grew past the
//! size threshold, and guarantees that threads throttled on write-back
//! wake up within a bounded time even when nothing else moves

use {
    super::{
        sb::VolumeSuper,
        txn::{commit_atom, TxnMode},
    },
    parking_lot::{Condvar, Mutex},
    std::{
        sync::Arc,
        thread::{self, JoinHandle},
        time::Duration,
    },
};

struct Shared {
    stop: Mutex<bool>,
    tick_cv: Condvar,
    /// broadcast after every maintenance pass so write-back throttled
    /// callers never stall indefinitely
    wb_cv: Condvar,
    wb_gate: Mutex<u64>,
}

pub struct Entd {
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl Entd {
    pub fn start(sb: &Arc<VolumeSuper>) -> Entd {
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            tick_cv: Condvar::new(),
            wb_cv: Condvar::new(),
            wb_gate: Mutex::new(0),
        });
        let sb = sb.clone();
        let sh = shared.clone();
        let handle = thread::Builder::new()
            .name("skyfs-entd".into())
            .spawn(move || run(sb, sh))
            .expect("entd spawn failed");
        Entd { shared, handle }
    }
    pub fn stop(self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
        }
        self.shared.tick_cv.notify_all();
        let _ = self.handle.join();
    }
    /// Park until the next maintenance pass (or `timeout`). What writepage
    /// throttling calls under memory pressure
    pub fn wait_for_pass(&self, timeout: Duration) {
        let mut gate = self.shared.wb_gate.lock();
        let seen = *gate;
        while *gate == seen {
            if self
                .shared
                .wb_cv
                .wait_for(&mut gate, timeout)
                .timed_out()
            {
                break;
            }
        }
    }
}

fn run(sb: Arc<VolumeSuper>, sh: Arc<Shared>) {
    log::info!("entd: running");
    loop {
        {
            let mut stop = sh.stop.lock();
            if *stop {
                break;
            }
            let _ = sh.tick_cv.wait_for(&mut stop, sb.tunables().entd_tick());
            if *stop {
                break;
            }
        }
        if sb.is_readonly() {
            continue;
        }
        maintenance_pass(&sb);
        {
            let mut gate = sh.wb_gate.lock();
            *gate += 1;
        }
        sh.wb_cv.notify_all();
    }
    log::info!("entd: stopped");
}

fn maintenance_pass(sb: &Arc<VolumeSuper>) {
    let overdue = sb.txnmgr().pick_overdue(
        sb.tunables().atom_max_age(),
        sb.tunables().atom_max_size,
    );
    if let Some(atom) = overdue {
        let _ctx = super::context::enter(sb, TxnMode::WriteFusing);
        log::debug!(
            "entd: committing overdue atom {} ({} captured)",
            atom.id(),
            atom.capture_count()
        );
        if let Err(e) = commit_atom(sb, &atom, false) {
            log::error!("entd: background commit of atom {} failed: {e}", atom.id());
        }
    }
}
