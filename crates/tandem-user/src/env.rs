//! The per-address-space self slot.
//!
//! Each address space records the id of the process that owns it in
//! `layout::SELF_SLOT`. A forked child inherits the parent's page, so the
//! slot is stale until the child rewrites it.

use crate::error::KernelError;
use crate::memory::{layout, Perm, UserMemory, PAGE_SIZE};
use crate::syscall::Kernel;
use crate::types::ContextId;
use log::{debug, warn};

/// Id recorded in the caller's self slot, if the slot has been written.
pub fn this_env<M: UserMemory>(mem: &M) -> Result<Option<ContextId>, KernelError> {
    mem.load(layout::SELF_SLOT).map(ContextId::new)
}

/// Point the caller's self slot at the caller.
pub fn refresh_this_env<K: Kernel>(kernel: &K) -> Result<ContextId, KernelError> {
    let me = kernel.current_id();
    if kernel.page_perm(layout::SELF_SLOT).is_none() {
        kernel.alloc_region(me, layout::SELF_SLOT, PAGE_SIZE, Perm::USER_RW)?;
    }
    kernel.store(layout::SELF_SLOT, me.val())?;
    Ok(me)
}

/// Program entry: set up the self slot, then run `umain`.
pub fn libmain<K: Kernel>(kernel: &K, umain: fn(&K)) {
    match refresh_this_env(kernel) {
        Ok(me) => debug!("libmain: running as {}", me),
        Err(e) => warn!("libmain: self slot unavailable: {}", e),
    }
    umain(kernel);
}
