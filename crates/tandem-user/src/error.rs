use crate::memory::VirtAddr;
use crate::types::ContextId;
use thiserror::Error;

/// Failures reported by the kernel capabilities the library consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("bad context: {0}")]
    BadContext(ContextId),

    #[error("no free context")]
    NoFreeContext,

    #[error("out of memory")]
    NoMemory,

    #[error("invalid range: {addr} + {len:#x}")]
    InvalidRange { addr: VirtAddr, len: u32 },

    #[error("invalid permission")]
    InvalidPermission,

    #[error("unhandled page fault: {op} at {addr}")]
    PageFault { op: &'static str, addr: VirtAddr },

    #[error("fault at {addr} is not a copy-on-write fault")]
    BadFault { addr: VirtAddr },
}

/// Recoverable fork failures. The caller may retry or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ForkError {
    #[error("caller has no page fault handler installed")]
    NoFaultHandler,

    #[error("cannot read the caller's fault handler: {0}")]
    HandlerLookup(KernelError),

    #[error("exofork failed: {0}")]
    Spawn(KernelError),

    #[error("mapping address space into {child} failed: {source}")]
    Map {
        child: ContextId,
        source: KernelError,
    },

    #[error("installing fault handler in {child} failed: {source}")]
    FaultHandler {
        child: ContextId,
        source: KernelError,
    },

    #[error("marking {child} runnable failed: {source}")]
    Runnable {
        child: ContextId,
        source: KernelError,
    },

    #[error("child could not repair its self slot: {0}")]
    Repair(KernelError),
}

impl ForkError {
    /// The child left behind in the kernel when setup failed after exofork.
    pub fn leaked_child(&self) -> Option<ContextId> {
        match self {
            ForkError::Map { child, .. }
            | ForkError::FaultHandler { child, .. }
            | ForkError::Runnable { child, .. } => Some(*child),
            _ => None,
        }
    }
}

/// Failures of the mutex and wait queue layer.
///
/// Apart from `NotOwner`, which changes nothing, these leave the mutex in a
/// state the library cannot vouch for; the host decides whether to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("cannot acquire mutex storage at {base}: {source}")]
    Storage { base: VirtAddr, source: KernelError },

    #[error("wait queue is empty")]
    QueueEmpty,

    #[error("wait queue is full ({0} waiters)")]
    QueueFull(u32),

    #[error("wait queue slot {0} holds no context")]
    CorruptSlot(u32),

    #[error("{caller} does not own the mutex")]
    NotOwner { caller: ContextId },

    #[error("cannot block {id}: {source}")]
    Block { id: ContextId, source: KernelError },

    #[error("cannot wake {id}: {source}")]
    Wake { id: ContextId, source: KernelError },

    #[error("mutex memory: {0}")]
    Memory(#[from] KernelError),

    #[error("mutex destroyed while waiting")]
    Destroyed,
}
