//! User-level fork with copy-on-write.

use crate::env;
use crate::error::ForkError;
use crate::memory::{Perm, VirtAddr, USER_TOP};
use crate::syscall::Kernel;
use crate::types::{Fork, RunState};
use log::{debug, info};

/// Duplicate the calling process.
///
/// The child gets the caller's whole user range mapped lazily, so both sides
/// keep reading the pages as they were at fork time and the first write on
/// either side takes a private copy through the fault upcall.
///
/// If setup fails after the child exists, the child is left in the kernel
/// not runnable; [`ForkError::leaked_child`] names it.
pub fn fork<K: Kernel>(kernel: &K) -> Result<Fork, ForkError> {
    let parent = kernel.current_id();
    let handler = kernel
        .fault_handler(parent)
        .map_err(ForkError::HandlerLookup)?
        .ok_or(ForkError::NoFaultHandler)?;

    let child = match kernel.exofork().map_err(ForkError::Spawn)? {
        Fork::Parent(child) => child,
        Fork::Child => {
            // The self slot came along with the parent's memory.
            let me = env::refresh_this_env(kernel).map_err(ForkError::Repair)?;
            debug!("fork: child {} running", me);
            return Ok(Fork::Child);
        }
    };

    kernel
        .map_region(
            parent,
            VirtAddr::new(0),
            child,
            VirtAddr::new(0),
            USER_TOP,
            Perm::USER_RW | Perm::LAZY | Perm::COMBINE,
        )
        .map_err(|source| ForkError::Map { child, source })?;
    kernel
        .set_fault_handler(child, Some(handler))
        .map_err(|source| ForkError::FaultHandler { child, source })?;
    kernel
        .set_run_state(child, RunState::Runnable)
        .map_err(|source| ForkError::Runnable { child, source })?;

    info!("fork: {} -> {}", parent, child);
    Ok(Fork::Parent(child))
}
