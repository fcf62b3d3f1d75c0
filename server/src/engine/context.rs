/*
 * Created on Tue Jan 30 2024
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

//! Per-thread engine contexts. Every entry point that touches the engine
//! opens a context carrying the thread's transaction handle, its lock
//! stack and the space it has reserved; nested entries pile onto the same
//! context and only the outermost exit runs the close-out (commit policy,
//! reservation release)

use {
    super::{
        lock::LockStack,
        sb::VolumeSuper,
        txn::{txn_begin, txn_end, TxnHandle, TxnMode},
    },
    std::sync::Arc,
};

struct EngineContext {
    txnh: Arc<TxnHandle>,
    stack: Arc<LockStack>,
    grabbed: u64,
    nesting: u32,
}

crate::local! {
    static CTX: Vec<EngineContext> = Vec::new();
}

/// RAII witness of an open context. Exit policy runs on drop of the
/// outermost guard
pub struct CtxGuard {
    sb: Arc<VolumeSuper>,
}

pub fn enter(sb: &Arc<VolumeSuper>, mode: TxnMode) -> CtxGuard {
    crate::local_mut!(CTX, |stk: &mut Vec<EngineContext>| {
        match stk.last_mut() {
            Some(top) => top.nesting += 1,
            None => stk.push(EngineContext {
                txnh: txn_begin(mode),
                stack: LockStack::new(),
                grabbed: 0,
                nesting: 0,
            }),
        }
    });
    CtxGuard { sb: sb.clone() }
}

impl Drop for CtxGuard {
    fn drop(&mut self) {
        let finished = crate::local_mut!(CTX, |stk: &mut Vec<EngineContext>| {
            match stk.last_mut() {
                Some(top) if top.nesting > 0 => {
                    top.nesting -= 1;
                    None
                }
                Some(_) => stk.pop(),
                None => None,
            }
        });
        if let Some(ctx) = finished {
            if ctx.grabbed > 0 {
                self.sb.space().release_grabbed(ctx.grabbed);
            }
            if let Err(e) = txn_end(&self.sb, &ctx.txnh) {
                log::error!("context exit: commit failed: {e}");
            }
        }
    }
}

pub fn current_txnh() -> Option<Arc<TxnHandle>> {
    crate::local_ref!(CTX, |stk: &Vec<EngineContext>| stk
        .last()
        .map(|c| c.txnh.clone()))
}

pub fn current_stack() -> Option<Arc<LockStack>> {
    crate::local_ref!(CTX, |stk: &Vec<EngineContext>| stk
        .last()
        .map(|c| c.stack.clone()))
}

pub fn in_context() -> bool {
    crate::local_ref!(CTX, |stk: &Vec<EngineContext>| !stk.is_empty())
}

/*
    reservation notebook (the space manager writes, context exit settles)
*/

pub fn grab_note(n: u64) {
    crate::local_mut!(CTX, |stk: &mut Vec<EngineContext>| {
        if let Some(top) = stk.last_mut() {
            top.grabbed += n;
        }
    })
}

pub fn grab_unnote(n: u64) {
    crate::local_mut!(CTX, |stk: &mut Vec<EngineContext>| {
        if let Some(top) = stk.last_mut() {
            top.grabbed = top.grabbed.saturating_sub(n);
        }
    })
}

/// Take the context's outstanding reservation for settlement
pub fn grab_take() -> u64 {
    crate::local_mut!(CTX, |stk: &mut Vec<EngineContext>| {
        match stk.last_mut() {
            Some(top) => core::mem::take(&mut top.grabbed),
            None => 0,
        }
    })
}
