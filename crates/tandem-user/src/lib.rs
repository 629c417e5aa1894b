//! Fork, threads and a FIFO mutex for processes running on a cooperative
//! kernel.
//!
//! Everything here is written against [`syscall::Kernel`]: the library never
//! schedules, maps or allocates on its own, it only sequences kernel calls
//! and manipulates words in user memory.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod env;
pub mod error;
pub mod fork;
pub mod memory;
pub mod pgfault;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{ForkError, KernelError, SyncError};
pub use fork::fork;
pub use memory::{Perm, UserMemory, VirtAddr, PAGE_SIZE};
pub use pgfault::{cow_fault_handler, set_pgfault_handler, Fault, FaultHandler};
pub use sync::{Mutex, WaitQueue};
pub use syscall::Kernel;
pub use thread::{thread_create, thread_join, EntryFn, ThreadStart};
pub use types::{ContextId, Fork, RunState};
