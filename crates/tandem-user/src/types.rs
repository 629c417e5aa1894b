use core::fmt;
use core::num::NonZeroU32;

/// Execution context identifier.
///
/// Processes and threads share one id space; a thread is a context that
/// happens to share its address space with another.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ContextId(NonZeroU32);

impl ContextId {
    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    pub fn val(&self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.val())
    }
}

/// Scheduling state as seen through the kernel contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Runnable,
    NotRunnable,
}

/// Outcome of a fork-like operation, observed once on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    /// Returned in the parent, carrying the new child's id.
    Parent(ContextId),
    /// Returned in the child.
    Child,
}
