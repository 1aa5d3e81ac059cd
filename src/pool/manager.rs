//! Thread pool manager: FIFO task queue plus FIFO idle-worker queue.
//!
//! Both queues live under one lock. Every transition (submit, worker
//! finished, start) runs the same assignment step while holding it, which
//! pairs the oldest idle worker with the oldest queued task until one of
//! the queues is empty. Hence, whenever the lock is released:
//! - no worker is idle while a task is queued
//! - every started worker is either idle or running exactly one task

use crate::pool::worker::{self, Inbox, WorkerId};
use crate::pool::TaskHandler;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of worker threads.
    pub size: usize,
    /// Workers waiting in the idle queue.
    pub idle: usize,
    /// Workers running a task.
    pub busy: usize,
    /// Tasks waiting for a worker.
    pub queued: usize,
}

/// Returned by `submit` once the pool has stopped, giving the task back.
pub struct PoolStopped<T>(pub T);

impl<T> fmt::Debug for PoolStopped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PoolStopped(..)")
    }
}

impl<T> fmt::Display for PoolStopped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("thread pool is stopped")
    }
}

impl<T> std::error::Error for PoolStopped<T> {}

struct PoolState<T> {
    tasks: VecDeque<T>,
    idle: VecDeque<WorkerId>,
    started: bool,
}

/// State shared by the manager and its workers.
pub(crate) struct PoolShared<T, H> {
    state: Mutex<PoolState<T>>,
    inboxes: Vec<Inbox<T>>,
    stopped: AtomicBool,
    handler: H,
}

impl<T, H> PoolShared<T, H>
where
    T: Send + 'static,
    H: TaskHandler<T>,
{
    pub fn inbox(&self, id: WorkerId) -> &Inbox<T> {
        &self.inboxes[id]
    }

    pub fn stopped(&self) -> &AtomicBool {
        &self.stopped
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn submit(&self, task: T) -> Result<(), PoolStopped<T>> {
        let mut state = self.lock();
        if self.stopped.load(Ordering::Acquire) {
            return Err(PoolStopped(task));
        }
        state.tasks.push_back(task);
        self.assign(&mut state);
        Ok(())
    }

    /// Return a worker to the idle queue and hand it queued work, if any.
    pub fn worker_finished(&self, id: WorkerId) {
        let mut state = self.lock();
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        state.idle.push_back(id);
        self.assign(&mut state);
    }

    /// Stop assigning work and wake every worker so it can exit.
    ///
    /// Returns the number of queued tasks that were discarded.
    pub fn halt(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            self.stopped.store(true, Ordering::Release);
            state.idle.clear();
            let discarded = state.tasks.len();
            state.tasks.clear();
            discarded
        };

        for inbox in &self.inboxes {
            inbox.wake();
        }
        discarded
    }

    fn start(&self) {
        let mut state = self.lock();
        if state.started || self.stopped.load(Ordering::Acquire) {
            return;
        }
        state.started = true;
        state.idle.extend(0..self.inboxes.len());
        self.assign(&mut state);
    }

    fn assign(&self, state: &mut PoolState<T>) {
        while !state.tasks.is_empty() && !state.idle.is_empty() {
            if let (Some(worker), Some(task)) = (state.idle.pop_front(), state.tasks.pop_front()) {
                self.inboxes[worker].deliver(task);
            }
        }
    }

    fn status(&self) -> PoolStatus {
        let state = self.lock();
        let size = self.inboxes.len();
        let busy = if state.started && !self.stopped.load(Ordering::Acquire) {
            size - state.idle.len()
        } else {
            0
        };
        PoolStatus {
            size,
            idle: state.idle.len(),
            busy,
            queued: state.tasks.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Fixed-size pool of worker threads executing tasks in FIFO order.
pub struct ThreadPoolManager<T, H> {
    shared: Arc<PoolShared<T, H>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<T, H> ThreadPoolManager<T, H>
where
    T: Send + 'static,
    H: TaskHandler<T>,
{
    /// Create a pool of `size` workers. No thread runs until `start`.
    ///
    /// # Panics
    /// Panics if `size` is zero.
    pub fn new(size: usize, handler: H) -> Self {
        assert!(size > 0, "thread pool needs at least one worker");
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    tasks: VecDeque::new(),
                    idle: VecDeque::with_capacity(size),
                    started: false,
                }),
                inboxes: (0..size).map(|_| Inbox::new()).collect(),
                stopped: AtomicBool::new(false),
                handler,
            }),
            threads: Mutex::new(Vec::with_capacity(size)),
        }
    }

    /// Launch the worker threads and make every worker idle.
    ///
    /// Tasks submitted before `start` are assigned now, in order.
    pub fn start(&self) -> io::Result<()> {
        let mut threads = self.lock_threads();
        if !threads.is_empty() {
            return Ok(());
        }

        for id in 0..self.size() {
            let pool = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker::run(id, pool))?;
            threads.push(handle);
        }

        self.shared.start();
        info!(workers = self.size(), "Thread pool started");
        Ok(())
    }

    /// Queue a task. It runs as soon as it reaches the head of the queue
    /// and a worker is idle. The queue is unbounded.
    pub fn submit(&self, task: T) -> Result<(), PoolStopped<T>> {
        self.shared.submit(task)
    }

    /// Stop the pool and join every worker.
    ///
    /// Workers finish their current task; queued tasks are discarded and
    /// their count returned.
    pub fn stop(&self) -> usize {
        let discarded = self.shared.halt();
        if discarded > 0 {
            warn!(discarded, "Thread pool stopped with queued tasks");
        }

        let threads = std::mem::take(&mut *self.lock_threads());
        let current = thread::current().id();
        for handle in threads {
            // A task stopping its own pool cannot join itself
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        debug!("Thread pool stopped");
        discarded
    }

    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    pub fn size(&self) -> usize {
        self.shared.inboxes.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.threads.lock() {
            Ok(threads) => threads,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T, H> Drop for ThreadPoolManager<T, H> {
    fn drop(&mut self) {
        // Workers hold the shared state, so they must be told to exit
        self.shared.stopped.store(true, Ordering::Release);
        for inbox in &self.shared.inboxes {
            inbox.wake();
        }
    }
}
