pub mod mutex;
pub mod wait_queue;

pub use mutex::Mutex;
pub use wait_queue::WaitQueue;
