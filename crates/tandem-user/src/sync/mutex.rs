//! A sleeping mutex built from two exchange words and a wait queue.
//!
//! `locked` decides who gets the fast path. `queue_guard` is a spin word
//! that serialises every access to the owner word and the wait queue; lock's
//! append and unlock's pop both go through [`Mutex::critical`]. Unlock never
//! clears `locked` while a waiter is queued: ownership moves straight to the
//! head of the queue, which is what keeps acquisition FIFO.

use crate::error::{KernelError, SyncError};
use crate::memory::{Perm, VirtAddr, PAGE_SIZE};
use crate::sync::wait_queue::WaitQueue;
use crate::syscall::Kernel;
use crate::types::{ContextId, RunState};
use log::{debug, info, trace};

const LOCKED: u32 = 0;
const QUEUE_GUARD: u32 = 1;
const OWNER: u32 = 2;

/// Bytes of user memory a mutex occupies: its own page plus the queue page.
pub const MUTEX_SPAN: u32 = 2 * PAGE_SIZE;

/// Handle to a mutex in shared user memory.
///
/// The handle is just an address, so every thread of the address space can
/// hold its own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutex {
    base: VirtAddr,
}

impl Mutex {
    /// Back `base` with fresh storage and reset it to unlocked.
    pub fn init<K: Kernel>(kernel: &K, base: VirtAddr) -> Result<Self, SyncError> {
        let me = kernel.current_id();
        kernel
            .alloc_region(me, base, MUTEX_SPAN, Perm::USER_RW)
            .map_err(|source| SyncError::Storage { base, source })?;

        let mutex = Self { base };
        kernel.store(mutex.word(LOCKED), 0)?;
        kernel.store(mutex.word(QUEUE_GUARD), 0)?;
        kernel.store(mutex.word(OWNER), 0)?;
        mutex.queue().init(kernel)?;

        debug!("mutex {}: initialised by {}", base, me);
        Ok(mutex)
    }

    /// Handle for a mutex some other context already initialised at `base`.
    pub const fn at(base: VirtAddr) -> Self {
        Self { base }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn queue(&self) -> WaitQueue {
        WaitQueue::at(self.base.offset(PAGE_SIZE))
    }

    /// Current holder, or `None` while unlocked.
    pub fn owner<K: Kernel>(&self, kernel: &K) -> Result<Option<ContextId>, SyncError> {
        if kernel.load(self.word(LOCKED))? == 0 {
            return Ok(None);
        }
        Ok(ContextId::new(kernel.load(self.word(OWNER))?))
    }

    pub fn lock<K: Kernel>(&self, kernel: &K) -> Result<(), SyncError> {
        let me = kernel.current_id();
        loop {
            if kernel.swap(self.word(LOCKED), 1)? == 0 {
                kernel.store(self.word(OWNER), me.val())?;
                trace!("mutex {}: {} acquired", self.base, me);
                return Ok(());
            }

            // Re-check under the guard: an unlock that found the queue empty
            // has cleared `locked` before letting anyone else in.
            let queued = self.critical(kernel, |queue| {
                if kernel.swap(self.word(LOCKED), 1)? == 0 {
                    kernel.store(self.word(OWNER), me.val())?;
                    return Ok(false);
                }
                queue.append(kernel, me)?;
                kernel
                    .set_run_state(me, RunState::NotRunnable)
                    .map_err(|source| SyncError::Block { id: me, source })?;
                Ok(true)
            })?;
            if !queued {
                trace!("mutex {}: {} acquired on re-check", self.base, me);
                return Ok(());
            }

            debug!("mutex {}: {} blocked", self.base, me);
            kernel.yield_now();

            match self.owner(kernel) {
                Ok(Some(owner)) if owner == me => {
                    debug!("mutex {}: {} woke as owner", self.base, me);
                    return Ok(());
                }
                Ok(_) => debug!("mutex {}: {} woke without ownership", self.base, me),
                // The storage was unmapped while we slept.
                Err(SyncError::Memory(KernelError::PageFault { .. })) => {
                    return Err(SyncError::Destroyed)
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn unlock<K: Kernel>(&self, kernel: &K) -> Result<(), SyncError> {
        let me = kernel.current_id();
        if self.owner(kernel)? != Some(me) {
            return Err(SyncError::NotOwner { caller: me });
        }

        let next = self.critical(kernel, |queue| {
            if queue.is_empty(kernel)? {
                kernel.store(self.word(OWNER), 0)?;
                kernel.swap(self.word(LOCKED), 0)?;
                return Ok(None);
            }
            let next = queue.pop(kernel)?;
            kernel.store(self.word(OWNER), next.val())?;
            Ok(Some(next))
        })?;

        match next {
            Some(next) => {
                kernel
                    .set_run_state(next, RunState::Runnable)
                    .map_err(|source| SyncError::Wake { id: next, source })?;
                debug!("mutex {}: {} handed off to {}", self.base, me, next);
            }
            None => trace!("mutex {}: {} released", self.base, me),
        }

        kernel.yield_now();
        Ok(())
    }

    /// Wake every waiter without granting ownership and release the storage.
    ///
    /// Returns how many contexts were woken. The caller must make sure no
    /// other context touches the mutex afterwards.
    pub fn destroy<K: Kernel>(&self, kernel: &K) -> Result<usize, SyncError> {
        let me = kernel.current_id();
        let woken = self.critical(kernel, |queue| {
            let mut woken = 0;
            while !queue.is_empty(kernel)? {
                let id = queue.pop(kernel)?;
                kernel
                    .set_run_state(id, RunState::Runnable)
                    .map_err(|source| SyncError::Wake { id, source })?;
                woken += 1;
            }
            kernel.store(self.word(OWNER), 0)?;
            kernel.swap(self.word(LOCKED), 0)?;
            Ok(woken)
        })?;

        kernel.unmap_region(me, self.base, MUTEX_SPAN)?;
        info!("mutex {}: destroyed by {}, {} waiters woken", self.base, me, woken);
        Ok(woken)
    }

    /// Run `f` with exclusive access to the owner word and the queue.
    fn critical<K, R, F>(&self, kernel: &K, f: F) -> Result<R, SyncError>
    where
        K: Kernel,
        F: FnOnce(WaitQueue) -> Result<R, SyncError>,
    {
        let guard = self.word(QUEUE_GUARD);
        while kernel.swap(guard, 1)? != 0 {
            core::hint::spin_loop();
        }
        let result = f(self.queue());
        kernel.swap(guard, 0)?;
        result
    }

    fn word(&self, index: u32) -> VirtAddr {
        self.base.word(index)
    }
}
