use crate::error::KernelError;
use crate::syscall::Kernel;
use crate::types::ContextId;
use log::{debug, trace};

/// Thread body. Runs with the spawning process's address space.
pub type EntryFn<K> = fn(&K);

/// Start routine of a new context.
///
/// The entry travels by value with each creation request, so back-to-back
/// spawns never observe each other's entry point.
pub struct ThreadStart<K> {
    pub trampoline: fn(&K, EntryFn<K>),
    pub entry: EntryFn<K>,
}

impl<K> ThreadStart<K> {
    pub fn run(&self, kernel: &K) {
        (self.trampoline)(kernel, self.entry)
    }
}

impl<K> Clone for ThreadStart<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for ThreadStart<K> {}

fn thread_main<K: Kernel>(kernel: &K, entry: EntryFn<K>) {
    trace!("thread {} entering", kernel.current_id());
    entry(kernel);
    trace!("thread {} returned", kernel.current_id());
}

/// Spawn a thread sharing the caller's address space.
pub fn thread_create<K: Kernel>(kernel: &K, entry: EntryFn<K>) -> Result<ContextId, KernelError> {
    let id = kernel.create_thread(ThreadStart {
        trampoline: thread_main::<K>,
        entry,
    })?;
    debug!("thread_create: {} spawned {}", kernel.current_id(), id);
    Ok(id)
}

pub fn thread_join<K: Kernel>(kernel: &K, id: ContextId) -> Result<(), KernelError> {
    kernel.join(id)?;
    debug!("thread_join: {} reaped {}", kernel.current_id(), id);
    Ok(())
}
