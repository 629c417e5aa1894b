//! Kernel and memory doubles for unit tests.

use crate::error::KernelError;
use crate::memory::{Perm, UserMemory, VirtAddr};
use crate::pgfault::FaultHandler;
use crate::syscall::Kernel;
use crate::thread::ThreadStart;
use crate::types::{ContextId, Fork, RunState};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

/// Flat word store with every address mapped and zeroed.
#[derive(Default)]
pub struct FlatMemory {
    words: RefCell<BTreeMap<u32, u32>>,
}

impl FlatMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek(&self, addr: VirtAddr) -> u32 {
        self.words.borrow().get(&addr.val()).copied().unwrap_or(0)
    }
}

impl UserMemory for FlatMemory {
    fn load(&self, addr: VirtAddr) -> Result<u32, KernelError> {
        Ok(self.peek(addr))
    }

    fn store(&self, addr: VirtAddr, value: u32) -> Result<(), KernelError> {
        self.words.borrow_mut().insert(addr.val(), value);
        Ok(())
    }

    fn swap(&self, addr: VirtAddr, value: u32) -> Result<u32, KernelError> {
        Ok(self
            .words
            .borrow_mut()
            .insert(addr.val(), value)
            .unwrap_or(0))
    }
}

/// Single-address-space kernel double over a [`FlatMemory`].
///
/// Nothing is ever scheduled: `yield_now` returns immediately and thread
/// creation fails. `exofork` fails unless a child id was set with
/// [`SoloKernel::spawn_as`]. Individual calls can be made to fail once.
pub struct SoloKernel {
    memory: FlatMemory,
    current: Cell<ContextId>,
    yields: Cell<usize>,
    alloc_failure: Cell<Option<KernelError>>,
    child: Cell<Option<ContextId>>,
    failures: RefCell<Vec<(&'static str, KernelError)>>,
    after_yield: RefCell<Vec<(&'static str, KernelError)>>,
    handler: Cell<Option<FaultHandler<SoloKernel>>>,
    transitions: RefCell<Vec<(ContextId, RunState)>>,
    unmapped: RefCell<Vec<(VirtAddr, u32)>>,
}

impl SoloKernel {
    pub fn new(id: u32) -> Self {
        Self {
            memory: FlatMemory::new(),
            current: Cell::new(ContextId::new(id).unwrap()),
            yields: Cell::new(0),
            alloc_failure: Cell::new(None),
            child: Cell::new(None),
            failures: RefCell::new(Vec::new()),
            after_yield: RefCell::new(Vec::new()),
            handler: Cell::new(None),
            transitions: RefCell::new(Vec::new()),
            unmapped: RefCell::new(Vec::new()),
        }
    }

    /// Pretend a different context is now running in this address space.
    pub fn become_context(&self, id: u32) {
        self.current.set(ContextId::new(id).unwrap());
    }

    pub fn fail_alloc(&self, error: KernelError) {
        self.alloc_failure.set(Some(error));
    }

    /// Let `exofork` succeed, handing out `child`.
    pub fn spawn_as(&self, child: u32) {
        self.child.set(ContextId::new(child));
    }

    /// Make the next `call` fail with `error`.
    pub fn fail_call(&self, call: &'static str, error: KernelError) {
        self.failures.borrow_mut().push((call, error));
    }

    /// Like [`SoloKernel::fail_call`], but only once the caller has yielded.
    pub fn fail_after_yield(&self, call: &'static str, error: KernelError) {
        self.after_yield.borrow_mut().push((call, error));
    }

    fn injected(&self, call: &'static str) -> Result<(), KernelError> {
        let mut failures = self.failures.borrow_mut();
        match failures.iter().position(|(name, _)| *name == call) {
            Some(pos) => Err(failures.remove(pos).1),
            None => Ok(()),
        }
    }

    pub fn yields(&self) -> usize {
        self.yields.get()
    }

    pub fn transitions(&self) -> Vec<(ContextId, RunState)> {
        self.transitions.borrow().clone()
    }

    pub fn unmapped(&self) -> Vec<(VirtAddr, u32)> {
        self.unmapped.borrow().clone()
    }
}

impl UserMemory for SoloKernel {
    fn load(&self, addr: VirtAddr) -> Result<u32, KernelError> {
        self.injected("load")?;
        self.memory.load(addr)
    }

    fn store(&self, addr: VirtAddr, value: u32) -> Result<(), KernelError> {
        self.injected("store")?;
        self.memory.store(addr, value)
    }

    fn swap(&self, addr: VirtAddr, value: u32) -> Result<u32, KernelError> {
        self.injected("swap")?;
        self.memory.swap(addr, value)
    }
}

impl Kernel for SoloKernel {
    fn exofork(&self) -> Result<Fork, KernelError> {
        self.injected("exofork")?;
        self.child
            .get()
            .map(Fork::Parent)
            .ok_or(KernelError::NoFreeContext)
    }

    fn map_region(
        &self,
        _src: ContextId,
        _src_addr: VirtAddr,
        _dst: ContextId,
        _dst_addr: VirtAddr,
        _len: u32,
        _perm: Perm,
    ) -> Result<(), KernelError> {
        self.injected("map_region")
    }

    fn alloc_region(
        &self,
        _id: ContextId,
        _addr: VirtAddr,
        _len: u32,
        _perm: Perm,
    ) -> Result<(), KernelError> {
        match self.alloc_failure.get() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn unmap_region(&self, _id: ContextId, addr: VirtAddr, len: u32) -> Result<(), KernelError> {
        self.unmapped.borrow_mut().push((addr, len));
        Ok(())
    }

    fn page_perm(&self, _addr: VirtAddr) -> Option<Perm> {
        Some(Perm::USER_RW)
    }

    fn set_fault_handler(
        &self,
        _id: ContextId,
        handler: Option<FaultHandler<Self>>,
    ) -> Result<(), KernelError> {
        self.injected("set_fault_handler")?;
        self.handler.set(handler);
        Ok(())
    }

    fn fault_handler(&self, _id: ContextId) -> Result<Option<FaultHandler<Self>>, KernelError> {
        self.injected("fault_handler")?;
        Ok(self.handler.get())
    }

    fn set_run_state(&self, id: ContextId, state: RunState) -> Result<(), KernelError> {
        self.injected("set_run_state")?;
        self.transitions.borrow_mut().push((id, state));
        Ok(())
    }

    fn current_id(&self) -> ContextId {
        self.current.get()
    }

    fn yield_now(&self) {
        self.yields.set(self.yields.get() + 1);
        let armed = std::mem::take(&mut *self.after_yield.borrow_mut());
        self.failures.borrow_mut().extend(armed);
    }

    fn create_thread(&self, _start: ThreadStart<Self>) -> Result<ContextId, KernelError> {
        Err(KernelError::NoFreeContext)
    }

    fn join(&self, _id: ContextId) -> Result<(), KernelError> {
        Ok(())
    }
}
