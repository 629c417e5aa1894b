//! Page fault upcalls and the copy-on-write materialiser.

use crate::error::KernelError;
use crate::memory::{copy_page, layout, Perm, VirtAddr, PAGE_SIZE};
use crate::syscall::Kernel;
use log::trace;

/// A fault delivered to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub addr: VirtAddr,
    pub write: bool,
}

/// Upcall invoked in the faulting context. Returning `Ok` means the access
/// can be retried.
pub type FaultHandler<K> = fn(&K, Fault) -> Result<(), KernelError>;

/// Install `handler` as the caller's upcall.
pub fn set_pgfault_handler<K: Kernel>(
    kernel: &K,
    handler: FaultHandler<K>,
) -> Result<(), KernelError> {
    kernel.set_fault_handler(kernel.current_id(), Some(handler))
}

/// Give the faulting context a private, writable copy of a lazily shared page.
pub fn cow_fault_handler<K: Kernel>(kernel: &K, fault: Fault) -> Result<(), KernelError> {
    let page = fault.addr.page_base();
    let perm = kernel.page_perm(page);
    if !fault.write || !perm.is_some_and(|p| p.contains(Perm::LAZY)) {
        return Err(KernelError::BadFault { addr: fault.addr });
    }

    let me = kernel.current_id();
    let scratch = layout::FAULT_SCRATCH;
    kernel.alloc_region(me, scratch, PAGE_SIZE, Perm::USER_RW)?;
    copy_page(kernel, scratch, page)?;
    kernel.map_region(me, scratch, me, page, PAGE_SIZE, Perm::USER_RW)?;
    kernel.unmap_region(me, scratch, PAGE_SIZE)?;

    trace!("cow: {} copied page {}", me, page);
    Ok(())
}
