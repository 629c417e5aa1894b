//! The kernel contract as seen from inside one simulated context.

use crate::memory::{self, AccessError, AddressSpace, SharedSpace};
use crate::thread::tcb::{ContextState, Start};
use crate::{Halted, Shared};
use log::{debug, trace};
use std::collections::VecDeque;
use std::panic;
use std::sync::Arc;
use tandem_user::memory::WORD_SIZE;
use tandem_user::{
    ContextId, Fault, FaultHandler, Fork, Kernel, KernelError, Perm, RunState, ThreadStart,
    UserMemory, VirtAddr,
};

/// System call interface of the context it was handed to.
pub struct SimEnv {
    id: ContextId,
    space: SharedSpace,
    shared: Arc<Shared>,
}

impl SimEnv {
    pub(crate) fn new(id: ContextId, space: SharedSpace, shared: Arc<Shared>) -> Self {
        Self { id, space, shared }
    }

    fn space_of(&self, id: ContextId) -> Result<SharedSpace, KernelError> {
        let board = self.shared.board();
        Ok(Arc::clone(&board.manager.get(id)?.space))
    }

    /// Run one access against our space, going through the fault upcall and
    /// retrying once if the first attempt faults.
    fn access<T>(
        &self,
        op: &'static str,
        addr: VirtAddr,
        write: bool,
        attempt: impl Fn(&AddressSpace) -> Result<T, AccessError>,
    ) -> Result<T, KernelError> {
        match attempt(&memory::lock(&self.space)) {
            Ok(value) => return Ok(value),
            Err(AccessError::Misaligned) => {
                return Err(KernelError::InvalidRange {
                    addr,
                    len: WORD_SIZE,
                })
            }
            Err(AccessError::Unmapped | AccessError::ReadOnly) => {}
        }

        let handler = self.shared.board().manager.get(self.id)?.fault_handler;
        let handler = handler.ok_or(KernelError::PageFault { op, addr })?;
        if let Err(e) = handler(self, Fault { addr, write }) {
            debug!("{}: fault handler gave up on {} at {}: {}", self.id, op, addr, e);
            return Err(KernelError::PageFault { op, addr });
        }

        attempt(&memory::lock(&self.space)).map_err(|_| KernelError::PageFault { op, addr })
    }

    /// Whether we are a fork child still replaying our parent's start
    /// routine up to the exofork that created us.
    fn replaying(&self) -> bool {
        self.shared
            .board()
            .manager
            .get(self.id)
            .is_ok_and(|tcb| tcb.fork_pending)
    }

    /// During a replay, calls aimed at other contexts are dropped: the parent
    /// already made them.
    fn skip_foreign(&self, id: ContextId) -> bool {
        let skip = id != self.id && self.replaying();
        if skip {
            trace!("{}: replay skips call on {}", self.id, id);
        }
        skip
    }
}

impl UserMemory for SimEnv {
    fn load(&self, addr: VirtAddr) -> Result<u32, KernelError> {
        self.access("load", addr, false, |space| space.load(addr))
    }

    fn store(&self, addr: VirtAddr, value: u32) -> Result<(), KernelError> {
        self.access("store", addr, true, |space| space.store(addr, value))
    }

    fn swap(&self, addr: VirtAddr, value: u32) -> Result<u32, KernelError> {
        self.access("swap", addr, true, |space| space.swap(addr, value))
    }
}

impl Kernel for SimEnv {
    fn exofork(&self) -> Result<Fork, KernelError> {
        let mut board = self.shared.board();
        let me = board.manager.get_mut(self.id)?;
        if me.fork_pending {
            // Earlier creations of the parent come back as they did then;
            // the exofork after them is the one that made us.
            if let Some(earlier) = me.replay.pop_front() {
                me.spawned.push(earlier);
                return Ok(Fork::Parent(earlier));
            }
            me.fork_pending = false;
            return Ok(Fork::Child);
        }

        let start = me.start.clone();
        let history: VecDeque<ContextId> = me.spawned.iter().copied().collect();
        let child =
            board
                .manager
                .create(ContextState::NotRunnable, AddressSpace::shared(), start.clone())?;
        let tcb = board.manager.get_mut(child)?;
        tcb.fork_pending = true;
        tcb.replay = history;
        board.manager.get_mut(self.id)?.spawned.push(child);
        drop(board);

        self.shared
            .spawn_context(child, start)
            .map_err(|_| KernelError::NoFreeContext)?;
        debug!("exofork: {} created {}", self.id, child);
        Ok(Fork::Parent(child))
    }

    fn map_region(
        &self,
        src: ContextId,
        src_addr: VirtAddr,
        dst: ContextId,
        dst_addr: VirtAddr,
        len: u32,
        perm: Perm,
    ) -> Result<(), KernelError> {
        if self.skip_foreign(src) || self.skip_foreign(dst) {
            return Ok(());
        }
        let src_space = self.space_of(src)?;
        let dst_space = self.space_of(dst)?;
        memory::map_range(&src_space, src_addr, &dst_space, dst_addr, len, perm)
    }

    fn alloc_region(
        &self,
        id: ContextId,
        addr: VirtAddr,
        len: u32,
        perm: Perm,
    ) -> Result<(), KernelError> {
        if self.skip_foreign(id) {
            return Ok(());
        }
        let space = self.space_of(id)?;
        let result = memory::lock(&space).alloc(&self.shared.frames, addr, len, perm);
        result
    }

    fn unmap_region(&self, id: ContextId, addr: VirtAddr, len: u32) -> Result<(), KernelError> {
        if self.skip_foreign(id) {
            return Ok(());
        }
        let space = self.space_of(id)?;
        let result = memory::lock(&space).unmap(addr, len);
        result
    }

    fn page_perm(&self, addr: VirtAddr) -> Option<Perm> {
        memory::lock(&self.space).perm(addr)
    }

    fn set_fault_handler(
        &self,
        id: ContextId,
        handler: Option<FaultHandler<Self>>,
    ) -> Result<(), KernelError> {
        if self.skip_foreign(id) {
            return Ok(());
        }
        self.shared.board().manager.get_mut(id)?.fault_handler = handler;
        Ok(())
    }

    fn fault_handler(&self, id: ContextId) -> Result<Option<FaultHandler<Self>>, KernelError> {
        Ok(self.shared.board().manager.get(id)?.fault_handler)
    }

    fn set_run_state(&self, id: ContextId, state: RunState) -> Result<(), KernelError> {
        if self.skip_foreign(id) {
            return Ok(());
        }
        self.shared.board().manager.request_run_state(id, state)
    }

    fn current_id(&self) -> ContextId {
        self.id
    }

    fn yield_now(&self) {
        let mut board = self.shared.board();
        self.shared.hand_off(&mut board, self.id);
        if self.shared.wait_turn(board, self.id).is_err() {
            // The run is over; unwind out of the program.
            panic::resume_unwind(Box::new(Halted));
        }
    }

    fn create_thread(&self, start: ThreadStart<Self>) -> Result<ContextId, KernelError> {
        let mut board = self.shared.board();
        let me = board.manager.get_mut(self.id)?;
        if me.fork_pending {
            if let Some(earlier) = me.replay.pop_front() {
                me.spawned.push(earlier);
                return Ok(earlier);
            }
        }
        let space = Arc::clone(&me.space);
        let handler = me.fault_handler;
        let id = board
            .manager
            .create(ContextState::Runnable, space, Start::Thread(start))?;
        board.manager.get_mut(id)?.fault_handler = handler;
        board.manager.get_mut(self.id)?.spawned.push(id);
        drop(board);

        self.shared
            .spawn_context(id, Start::Thread(start))
            .map_err(|_| KernelError::NoFreeContext)?;
        Ok(id)
    }

    fn join(&self, id: ContextId) -> Result<(), KernelError> {
        if id == self.id {
            return Err(KernelError::BadContext(id));
        }
        if self.replaying() {
            return Ok(());
        }
        {
            let mut board = self.shared.board();
            match board.manager.contexts.get_mut(&id) {
                None => return Err(KernelError::BadContext(id)),
                Some(tcb) if !tcb.is_live() => return Ok(()),
                Some(tcb) => tcb.joiners.push(self.id),
            }
            board.manager.set_run_state(self.id, RunState::NotRunnable)?;
        }
        self.yield_now();
        Ok(())
    }
}
