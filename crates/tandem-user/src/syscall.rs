//! The kernel capabilities the library is built on.
//!
//! Every method maps onto one system call of the host kernel. `tandem-kernel`
//! provides a simulated implementation; a native port would issue `ecall`s.

use crate::error::KernelError;
use crate::memory::{Perm, UserMemory, VirtAddr};
use crate::pgfault::FaultHandler;
use crate::thread::ThreadStart;
use crate::types::{ContextId, Fork, RunState};

pub trait Kernel: UserMemory + Sized {
    /// Create a blank, not-runnable process with no mappings.
    ///
    /// Reports `Fork::Parent(child)` to the caller and `Fork::Child` inside
    /// the new process once it is scheduled.
    fn exofork(&self) -> Result<Fork, KernelError>;

    /// Map `len` bytes of `src`'s space at `src_addr` into `dst` at `dst_addr`.
    ///
    /// With `Perm::LAZY` both sides end up copy-on-write. Without
    /// `Perm::COMBINE`, destination pages in the range that the source does
    /// not back are dropped.
    fn map_region(
        &self,
        src: ContextId,
        src_addr: VirtAddr,
        dst: ContextId,
        dst_addr: VirtAddr,
        len: u32,
        perm: Perm,
    ) -> Result<(), KernelError>;

    /// Back `len` bytes at `addr` in `id`'s space with fresh zeroed pages.
    fn alloc_region(
        &self,
        id: ContextId,
        addr: VirtAddr,
        len: u32,
        perm: Perm,
    ) -> Result<(), KernelError>;

    fn unmap_region(&self, id: ContextId, addr: VirtAddr, len: u32) -> Result<(), KernelError>;

    /// Permissions of the caller's mapping at `addr`, if any.
    fn page_perm(&self, addr: VirtAddr) -> Option<Perm>;

    fn set_fault_handler(
        &self,
        id: ContextId,
        handler: Option<FaultHandler<Self>>,
    ) -> Result<(), KernelError>;

    fn fault_handler(&self, id: ContextId) -> Result<Option<FaultHandler<Self>>, KernelError>;

    fn set_run_state(&self, id: ContextId, state: RunState) -> Result<(), KernelError>;

    fn current_id(&self) -> ContextId;

    /// Give up the CPU. Returns once the scheduler picks the caller again.
    fn yield_now(&self);

    /// Start a context sharing the caller's address space.
    fn create_thread(&self, start: ThreadStart<Self>) -> Result<ContextId, KernelError>;

    /// Block until `id` has exited.
    fn join(&self, id: ContextId) -> Result<(), KernelError>;
}
