//! A simulated cooperative kernel for running tandem programs on a host.
//!
//! Every context gets its own OS thread, but only the context holding the
//! baton executes; `yield_now` passes the baton round-robin. Memory lives in
//! paged address spaces with copy-on-write mappings, and faulting accesses
//! are delivered to the context's upcall before being retried.

pub mod error;
pub mod memory;
pub mod syscall;
pub mod thread;

pub use error::MachineError;
pub use syscall::SimEnv;

use log::{debug, info, warn};
use memory::{AddressSpace, FramePool};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tandem_user::{ContextId, RunState, VirtAddr};
use thread::tcb::{ContextState, Start};
use thread::ContextManager;

#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Physical frames available to all address spaces together.
    pub frame_limit: usize,
    /// Live contexts the kernel will track at once.
    pub max_contexts: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            frame_limit: 1024,
            max_contexts: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Idle,
    Running,
    Finished,
    Deadlock,
}

pub(crate) struct Board {
    pub(crate) manager: ContextManager,
    pub(crate) status: Status,
    pub(crate) panics: Vec<(ContextId, String)>,
    pub(crate) deadlocked: Vec<ContextId>,
}

/// Unwind payload used to take contexts down when a run ends under them.
pub(crate) struct Halted;

pub(crate) struct Shared {
    pub(crate) frames: Arc<FramePool>,
    board: Mutex<Board>,
    baton: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn board(&self) -> MutexGuard<'_, Board> {
        self.board
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Park until `id` holds the baton, or fail once the run is over.
    pub(crate) fn wait_turn<'a>(
        &'a self,
        mut board: MutexGuard<'a, Board>,
        id: ContextId,
    ) -> Result<MutexGuard<'a, Board>, Halted> {
        loop {
            if board.status != Status::Running {
                return Err(Halted);
            }
            if board.manager.current == Some(id) {
                return Ok(board);
            }
            board = self
                .baton
                .wait(board)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Pass the baton on from `from`, ending the run if nobody can take it.
    pub(crate) fn hand_off(&self, board: &mut Board, from: ContextId) {
        if board.manager.reschedule(from).is_none() {
            let blocked = board.manager.blocked();
            if blocked.is_empty() {
                debug!("run finished");
                board.status = Status::Finished;
            } else {
                warn!("deadlock: {:?} blocked with nothing runnable", blocked);
                board.status = Status::Deadlock;
                board.deadlocked = blocked;
            }
        }
        self.baton.notify_all();
    }

    pub(crate) fn spawn_context(self: &Arc<Self>, id: ContextId, start: Start) -> std::io::Result<()> {
        let shared = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("context-{}", id))
            .spawn(move || shared.run_context(id, start))?;
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
        Ok(())
    }

    fn run_context(self: Arc<Self>, id: ContextId, start: Start) {
        let space = match self.wait_turn(self.board(), id) {
            Ok(board) => match board.manager.get(id) {
                Ok(tcb) => Arc::clone(&tcb.space),
                Err(_) => return,
            },
            Err(Halted) => return,
        };

        let env = SimEnv::new(id, space, Arc::clone(&self));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| start.run(&env)));

        let mut board = self.board();
        if let Err(payload) = outcome {
            if !payload.is::<Halted>() {
                let message = panic_message(payload.as_ref());
                warn!("context {} panicked: {}", id, message);
                board.panics.push((id, message));
            }
        }
        board.manager.exit(id);
        if board.status == Status::Running {
            self.hand_off(&mut board, id);
        } else {
            self.baton.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".into()
    }
}

/// What happened during one [`Machine::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub root: ContextId,
    pub exited: Vec<ContextId>,
    /// Contexts created but never made runnable, e.g. children of a failed fork.
    pub never_started: Vec<ContextId>,
    /// Every `set_run_state` request, in order.
    pub transitions: Vec<(ContextId, RunState)>,
}

impl RunReport {
    /// How many times `id` was asked to become runnable.
    pub fn wakeups(&self, id: ContextId) -> usize {
        self.transitions
            .iter()
            .filter(|&&(who, state)| who == id && state == RunState::Runnable)
            .count()
    }
}

pub struct Machine {
    shared: Arc<Shared>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        info!(
            "machine: {} frames, {} contexts",
            config.frame_limit, config.max_contexts
        );
        Self {
            shared: Arc::new(Shared {
                frames: FramePool::new(config.frame_limit),
                board: Mutex::new(Board {
                    manager: ContextManager::new(config.max_contexts),
                    status: Status::Idle,
                    panics: Vec::new(),
                    deadlocked: Vec::new(),
                }),
                baton: Condvar::new(),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Boot `program` in a fresh process and run until nothing is runnable.
    pub fn run<F>(&self, program: F) -> Result<RunReport, MachineError>
    where
        F: Fn(&SimEnv) + Send + Sync + 'static,
    {
        let start = Start::Program(Arc::new(program));
        let root = {
            let mut board = self.shared.board();
            let root =
                board
                    .manager
                    .create(ContextState::Runnable, AddressSpace::shared(), start.clone())?;
            board.manager.reschedule(root);
            board.status = Status::Running;
            root
        };

        info!("run: booting {}", root);
        if let Err(e) = self.shared.spawn_context(root, start) {
            self.shared.board().status = Status::Finished;
            return Err(e.into());
        }

        {
            let mut board = self.shared.board();
            while board.status == Status::Running {
                board = self
                    .shared
                    .baton
                    .wait(board)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
        self.join_contexts();

        let mut board = self.shared.board();
        let transitions = board.manager.take_transitions();
        let first_panic = board.panics.drain(..).next();
        if let Some((id, message)) = first_panic {
            return Err(MachineError::ContextPanicked { id, message });
        }
        if board.status == Status::Deadlock {
            return Err(MachineError::Deadlock {
                blocked: std::mem::take(&mut board.deadlocked),
            });
        }

        let report = RunReport {
            root,
            exited: board.manager.exited(),
            never_started: board.manager.never_started(),
            transitions,
        };
        info!(
            "run: {} contexts exited, {} never started",
            report.exited.len(),
            report.never_started.len()
        );
        Ok(report)
    }

    /// Read a word of `id`'s address space after a run.
    pub fn peek(&self, id: ContextId, addr: VirtAddr) -> Option<u32> {
        let board = self.shared.board();
        let tcb = board.manager.contexts.get(&id)?;
        let value = memory::lock(&tcb.space).load(addr).ok();
        value
    }

    /// Frames currently backing some mapping.
    pub fn frames_in_use(&self) -> usize {
        self.shared.frames.live()
    }

    fn join_contexts(&self) {
        loop {
            let handles = std::mem::take(
                &mut *self
                    .shared
                    .handles
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    warn!("context thread died outside its program");
                }
            }
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}
