pub mod scheduler;
pub mod tcb;

use crate::memory::SharedSpace;
use log::{debug, trace};
use scheduler::{RoundRobinScheduler, Scheduler};
use std::collections::HashMap;
use tandem_user::{ContextId, KernelError, RunState};
use tcb::{ContextControlBlock, ContextState, Start};

/// Context table plus the ready queue.
pub struct ContextManager {
    pub contexts: HashMap<ContextId, ContextControlBlock>,
    pub scheduler: Box<dyn Scheduler>,
    pub current: Option<ContextId>,
    next_id: u32,
    max_contexts: usize,
    transitions: Vec<(ContextId, RunState)>,
}

impl ContextManager {
    pub fn new(max_contexts: usize) -> Self {
        Self {
            contexts: HashMap::new(),
            scheduler: Box::new(RoundRobinScheduler::new()),
            current: None,
            next_id: 1,
            max_contexts,
            transitions: Vec::new(),
        }
    }

    /// Register a context. Runnable contexts join the ready queue at once.
    pub fn create(
        &mut self,
        state: ContextState,
        space: SharedSpace,
        start: Start,
    ) -> Result<ContextId, KernelError> {
        let live = self.contexts.values().filter(|tcb| tcb.is_live()).count();
        if live >= self.max_contexts {
            return Err(KernelError::NoFreeContext);
        }
        let id = ContextId::new(self.next_id).ok_or(KernelError::NoFreeContext)?;
        self.next_id += 1;

        self.contexts
            .insert(id, ContextControlBlock::new(id, state, space, start));
        if state == ContextState::Runnable {
            self.scheduler.enqueue(id);
        }
        debug!("context {} created ({:?})", id, state);
        Ok(id)
    }

    /// A live context, or `BadContext`.
    pub fn get(&self, id: ContextId) -> Result<&ContextControlBlock, KernelError> {
        self.contexts
            .get(&id)
            .filter(|tcb| tcb.is_live())
            .ok_or(KernelError::BadContext(id))
    }

    pub fn get_mut(&mut self, id: ContextId) -> Result<&mut ContextControlBlock, KernelError> {
        self.contexts
            .get_mut(&id)
            .filter(|tcb| tcb.is_live())
            .ok_or(KernelError::BadContext(id))
    }

    pub fn set_run_state(&mut self, id: ContextId, state: RunState) -> Result<(), KernelError> {
        let tcb = self.get_mut(id)?;
        match (state, tcb.state) {
            (RunState::Runnable, ContextState::NotRunnable) => {
                tcb.state = ContextState::Runnable;
                self.scheduler.enqueue(id);
            }
            (RunState::NotRunnable, ContextState::Runnable) => {
                tcb.state = ContextState::NotRunnable;
                self.scheduler.dequeue(id);
            }
            // A running context blocking itself keeps the CPU until it yields.
            (RunState::NotRunnable, ContextState::Running) => {
                tcb.state = ContextState::NotRunnable;
            }
            _ => {}
        }
        trace!("context {} -> {:?}", id, state);
        Ok(())
    }

    /// `set_run_state` on behalf of a user request; these are what a run
    /// report lists.
    pub fn request_run_state(&mut self, id: ContextId, state: RunState) -> Result<(), KernelError> {
        self.set_run_state(id, state)?;
        self.transitions.push((id, state));
        Ok(())
    }

    /// Give up the CPU on behalf of `from` and pick the next context.
    ///
    /// A still-running `from` goes to the back of the ready queue, so it is
    /// picked again only when nobody else is runnable.
    pub fn reschedule(&mut self, from: ContextId) -> Option<ContextId> {
        if let Some(tcb) = self.contexts.get_mut(&from) {
            if tcb.state == ContextState::Running {
                tcb.state = ContextState::Runnable;
                self.scheduler.enqueue(from);
            }
        }

        while let Some(next) = self.scheduler.schedule() {
            let Some(tcb) = self.contexts.get_mut(&next) else {
                continue;
            };
            if tcb.state != ContextState::Runnable {
                continue;
            }
            tcb.state = ContextState::Running;
            tcb.started = true;
            self.current = Some(next);
            if next != from {
                trace!("switch {} -> {}", from, next);
            }
            return Some(next);
        }

        self.current = None;
        None
    }

    /// Mark `id` exited and make its joiners runnable again.
    pub fn exit(&mut self, id: ContextId) {
        let joiners = match self.contexts.get_mut(&id) {
            Some(tcb) => {
                tcb.state = ContextState::Exited;
                std::mem::take(&mut tcb.joiners)
            }
            None => return,
        };
        self.scheduler.dequeue(id);
        for joiner in joiners {
            if let Ok(tcb) = self.get_mut(joiner) {
                if tcb.state == ContextState::NotRunnable {
                    tcb.state = ContextState::Runnable;
                    self.scheduler.enqueue(joiner);
                }
            }
        }
        if self.current == Some(id) {
            self.current = None;
        }
        debug!("context {} exited", id);
    }

    /// Contexts that ran at some point and are now stuck.
    pub fn blocked(&self) -> Vec<ContextId> {
        let mut blocked: Vec<_> = self
            .contexts
            .values()
            .filter(|tcb| tcb.is_live() && tcb.started)
            .map(|tcb| tcb.id)
            .collect();
        blocked.sort();
        blocked
    }

    /// Live contexts that were never scheduled.
    pub fn never_started(&self) -> Vec<ContextId> {
        let mut idle: Vec<_> = self
            .contexts
            .values()
            .filter(|tcb| tcb.is_live() && !tcb.started)
            .map(|tcb| tcb.id)
            .collect();
        idle.sort();
        idle
    }

    pub fn exited(&self) -> Vec<ContextId> {
        let mut exited: Vec<_> = self
            .contexts
            .values()
            .filter(|tcb| !tcb.is_live())
            .map(|tcb| tcb.id)
            .collect();
        exited.sort();
        exited
    }

    pub fn take_transitions(&mut self) -> Vec<(ContextId, RunState)> {
        std::mem::take(&mut self.transitions)
    }
}
