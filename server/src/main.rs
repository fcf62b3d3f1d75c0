/*
 * Created on Mon Feb 05 2024
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

//! # SkyFS
//!
//! `skyfsd` is the volume tool and daemon around the SkyFS storage engine:
//! it creates volumes, mounts them (replaying the journal if the last
//! shutdown was not clean) and keeps the background maintenance running.
//! The engine itself lives in the `engine` module

#[macro_use]
pub mod util;
#[macro_use]
mod engine;

use {
    crate::engine::{
        config::Config,
        sb::{self, MkfsOpts},
        vdev::{DeviceRef, FileDevice},
    },
    env_logger::Builder,
    std::{env, io::BufRead, process, sync::Arc},
};

#[cfg(all(not(target_env = "msvc"), not(miri)))]
use jemallocator::Jemalloc;

#[cfg(all(not(target_env = "msvc"), not(miri)))]
#[global_allocator]
/// Jemallocator - the default allocator for every platform except msvc
static GLOBAL: Jemalloc = Jemalloc;

fn main() {
    Builder::new()
        .parse_filters(&env::var("SKYFS_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();
    let args: Vec<String> = env::args().collect();
    let (cmd, cfg_path) = match args.as_slice() {
        [_, cmd, path] => (cmd.as_str(), path.as_str()),
        [_, cmd] => (cmd.as_str(), "skyfs.yaml"),
        _ => usage(),
    };
    let cfg = match Config::load(cfg_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("{e}");
            util::exit_error()
        }
    };
    let outcome = match cmd {
        "mkfs" => do_mkfs(&cfg),
        "check" => do_check(&cfg),
        "run" => do_run(&cfg),
        _ => usage(),
    };
    if let Err(e) = outcome {
        log::error!("{cmd} failed: {e}");
        util::exit_error()
    }
}

fn usage() -> ! {
    eprintln!("usage: skyfsd <mkfs|check|run> [config.yaml]");
    process::exit(0x01)
}

fn open_device(cfg: &Config) -> engine::RuntimeResult<DeviceRef> {
    Ok(Arc::new(FileDevice::open(&cfg.volume)?))
}

fn do_mkfs(cfg: &Config) -> engine::RuntimeResult<()> {
    let blocks = match cfg.mkfs_blocks {
        Some(b) => b,
        None => {
            log::error!("mkfs needs `mkfs_blocks` in the config");
            return Err(engine::Error::NotFound);
        }
    };
    let dev: DeviceRef = Arc::new(FileDevice::create(&cfg.volume, blocks)?);
    let uuid = sb::mkfs(
        &dev,
        MkfsOpts {
            label: cfg.label.clone(),
            large_keys: cfg.tunables.large_keys,
        },
    )?;
    log::info!("created volume {} at {}", uuid, cfg.volume);
    Ok(())
}

fn do_check(cfg: &Config) -> engine::RuntimeResult<()> {
    let dev = open_device(cfg)?;
    let sup = sb::mount(dev, cfg.tunables.clone())?;
    let c = sup.space().counters();
    log::info!(
        "volume {}: {} blocks, {} free ({} committed free), {} files",
        sup.uuid(),
        sup.block_count(),
        c.free,
        c.free_committed,
        sup.file_count()
    );
    sb::unmount(&sup)
}

fn do_run(cfg: &Config) -> engine::RuntimeResult<()> {
    let dev = open_device(cfg)?;
    let sup = sb::mount(dev, cfg.tunables.clone())?;
    sup.start_daemon();
    log::info!("volume online; close stdin to unmount");
    // the volume stays mounted until our caller hangs up
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        if line.is_err() {
            break;
        }
    }
    sb::unmount(&sup)
}
