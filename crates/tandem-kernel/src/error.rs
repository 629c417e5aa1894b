use tandem_user::{ContextId, KernelError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("deadlock: contexts {blocked:?} are blocked and nothing is runnable")]
    Deadlock { blocked: Vec<ContextId> },

    #[error("context {id} panicked: {message}")]
    ContextPanicked { id: ContextId, message: String },

    #[error("cannot boot root context: {0}")]
    Boot(#[from] KernelError),

    #[error("cannot start context thread: {0}")]
    Spawn(#[from] std::io::Error),
}
