//! Fixed-size worker pool.
//!
//! Threads are created once at `start` and live until `stop`. The pool
//! manager keeps two FIFO queues under one lock:
//! - pending tasks, appended by `submit`
//! - idle workers, appended by a worker when it finishes a task
//!
//! Whenever both are non-empty the heads are paired and the task is
//! delivered to that worker's private inbox. Assignment order therefore
//! equals submission order; completion order across workers is not
//! guaranteed.

mod manager;
mod worker;

pub use manager::{PoolStatus, PoolStopped, ThreadPoolManager};
pub use worker::WorkerId;

/// Effect of a task, executed on a worker thread.
pub trait TaskHandler<T>: Send + Sync + 'static {
    fn execute(&self, worker: WorkerId, task: T);
}

impl<T, F> TaskHandler<T> for F
where
    F: Fn(WorkerId, T) + Send + Sync + 'static,
{
    fn execute(&self, worker: WorkerId, task: T) {
        self(worker, task)
    }
}
