//! Worker threads and their single-task inboxes.

use crate::pool::manager::PoolShared;
use crate::pool::TaskHandler;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace};

/// Index of a worker within its pool.
pub type WorkerId = usize;

/// Private inbox of one worker. Holds at most one assigned task.
pub(crate) struct Inbox<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Inbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Hand a task to the worker.
    ///
    /// Only called by the pool for a worker it just took off the idle
    /// queue, so the slot is always empty here.
    pub fn deliver(&self, task: T) {
        let mut slot = self.lock();
        debug_assert!(slot.is_none(), "worker assigned two tasks");
        *slot = Some(task);
        self.ready.notify_one();
    }

    /// Block until a task is assigned or the pool stops.
    ///
    /// An assigned task is returned even if the pool stopped meanwhile.
    pub fn wait(&self, stopped: &AtomicBool) -> Option<T> {
        let mut slot = self.lock();
        loop {
            if let Some(task) = slot.take() {
                return Some(task);
            }
            if stopped.load(Ordering::Acquire) {
                return None;
            }
            slot = match self.ready.wait(slot) {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Wake the worker so it re-checks the stop flag.
    pub fn wake(&self) {
        let _slot = self.lock();
        self.ready.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Worker run loop: wait for an assignment, execute it, report back.
pub(crate) fn run<T, H>(id: WorkerId, pool: Arc<PoolShared<T, H>>)
where
    T: Send + 'static,
    H: TaskHandler<T>,
{
    debug!(worker = id, "Worker started");

    while let Some(task) = pool.inbox(id).wait(pool.stopped()) {
        trace!(worker = id, "Task assigned");

        let result = panic::catch_unwind(AssertUnwindSafe(|| pool.handler().execute(id, task)));
        if result.is_err() {
            error!(worker = id, "Task panicked, stopping thread pool");
            pool.halt();
            break;
        }

        pool.worker_finished(id);
    }

    debug!(worker = id, "Worker stopped");
}
