use std::collections::VecDeque;
use tandem_user::ContextId;

pub trait Scheduler: Send {
    /// Select next context to run
    fn schedule(&mut self) -> Option<ContextId>;

    /// Add context to ready queue
    fn enqueue(&mut self, id: ContextId);

    /// Remove context from ready queue (e.g. if blocked by someone else)
    fn dequeue(&mut self, id: ContextId) -> bool;
}

#[derive(Debug, Default)]
pub struct RoundRobinScheduler {
    ready_queue: VecDeque<ContextId>,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for RoundRobinScheduler {
    fn schedule(&mut self) -> Option<ContextId> {
        self.ready_queue.pop_front()
    }

    fn enqueue(&mut self, id: ContextId) {
        if !self.ready_queue.contains(&id) {
            self.ready_queue.push_back(id);
        }
    }

    fn dequeue(&mut self, id: ContextId) -> bool {
        if let Some(pos) = self.ready_queue.iter().position(|&h| h == id) {
            self.ready_queue.remove(pos);
            true
        } else {
            false
        }
    }
}
