use crate::memory::SharedSpace;
use crate::syscall::SimEnv;
use std::collections::VecDeque;
use std::sync::Arc;
use tandem_user::{ContextId, FaultHandler, ThreadStart};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Runnable,
    Running,
    NotRunnable,
    Exited,
}

/// Body of a simulated program.
pub type Program = Arc<dyn Fn(&SimEnv) + Send + Sync>;

/// Where a context begins executing.
#[derive(Clone)]
pub enum Start {
    Program(Program),
    Thread(ThreadStart<SimEnv>),
}

impl Start {
    pub fn run(&self, env: &SimEnv) {
        match self {
            Start::Program(program) => program(env),
            Start::Thread(start) => start.run(env),
        }
    }
}

pub struct ContextControlBlock {
    pub id: ContextId,
    pub state: ContextState,
    pub space: SharedSpace,
    pub start: Start,
    pub fault_handler: Option<FaultHandler<SimEnv>>,
    /// Set on a fork child while it replays its parent's start routine up to
    /// the exofork that created it.
    pub fork_pending: bool,
    /// Ids the replay hands back, in order, for creations the parent made
    /// before that exofork.
    pub replay: VecDeque<ContextId>,
    /// Every context this one created, replayed creations included.
    pub spawned: Vec<ContextId>,
    /// Whether the context has ever held the CPU.
    pub started: bool,
    pub joiners: Vec<ContextId>,
}

impl ContextControlBlock {
    pub fn new(id: ContextId, state: ContextState, space: SharedSpace, start: Start) -> Self {
        Self {
            id,
            state,
            space,
            start,
            fault_handler: None,
            fork_pending: false,
            replay: VecDeque::new(),
            spawned: Vec::new(),
            started: false,
            joiners: Vec::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.state != ContextState::Exited
    }
}
