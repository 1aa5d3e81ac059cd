//! Cross-thread handoff of connection changes to the reactor.
//!
//! Only the reactor thread touches a connection's registration, interest
//! or write queue. Every other thread describes the mutation as a
//! `PendingChange`, pushes it here and wakes the reactor, which applies the
//! queued changes in FIFO order before its next readiness wait.

use crate::runtime::token::ConnHandle;
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Waker};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Mutex, MutexGuard};

/// What a pending change does to its target connection.
pub enum ChangeKind<S> {
    /// Register a new outbound connection whose connect is in flight.
    Register {
        stream: TcpStream,
        session: S,
    },
    /// Replace the connection's interest.
    ChangeInterest(Interest),
    /// Append to the write queue and request write interest.
    Write(Bytes),
    /// Close the connection.
    Close,
}

impl<S> fmt::Debug for ChangeKind<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Register { .. } => f.write_str("Register"),
            ChangeKind::ChangeInterest(interest) => write!(f, "ChangeInterest({interest:?})"),
            ChangeKind::Write(data) => write!(f, "Write({} bytes)", data.len()),
            ChangeKind::Close => f.write_str("Close"),
        }
    }
}

/// A request to mutate one connection, applied by the owning reactor.
#[derive(Debug)]
pub struct PendingChange<S> {
    pub target: ConnHandle,
    pub kind: ChangeKind<S>,
}

impl<S> PendingChange<S> {
    pub fn new(target: ConnHandle, kind: ChangeKind<S>) -> Self {
        Self { target, kind }
    }
}

/// FIFO of pending changes plus the waker of the reactor consuming them.
pub struct DispatchQueue<S> {
    changes: Mutex<VecDeque<PendingChange<S>>>,
    waker: Waker,
}

impl<S> DispatchQueue<S> {
    pub fn new(waker: Waker) -> Self {
        Self {
            changes: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    /// Queue a change and wake the reactor.
    ///
    /// The lock is released before waking so the reactor never contends
    /// with the submitter.
    pub fn submit(&self, change: PendingChange<S>) -> io::Result<()> {
        self.lock().push_back(change);
        self.wake()
    }

    /// Wake the reactor without queueing anything.
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Take every queued change, oldest first.
    pub fn drain(&self) -> VecDeque<PendingChange<S>> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of changes not yet applied.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingChange<S>>> {
        // A panicking submitter cannot leave the queue half-mutated.
        match self.changes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::token::{HandleAllocator, WAKER_TOKEN};
    use mio::{Events, Poll};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_drain_is_fifo() {
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).unwrap();
        let queue: DispatchQueue<()> = DispatchQueue::new(waker);
        let handles = HandleAllocator::new();
        let h = handles.alloc();

        queue.submit(PendingChange::new(h, ChangeKind::Write(Bytes::from_static(b"a")))).unwrap();
        queue.submit(PendingChange::new(h, ChangeKind::ChangeInterest(Interest::READABLE))).unwrap();
        queue.submit(PendingChange::new(h, ChangeKind::Close)).unwrap();
        assert_eq!(queue.len(), 3);

        let drained: Vec<_> = queue.drain().into_iter().map(|c| c.kind).collect();
        assert_eq!(drained.len(), 3);
        assert!(matches!(&drained[0], ChangeKind::Write(data) if data.as_ref() == b"a"));
        assert!(matches!(drained[1], ChangeKind::ChangeInterest(i) if i == Interest::READABLE));
        assert!(matches!(drained[2], ChangeKind::Close));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_submit_wakes_blocked_poll() {
        let mut poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).unwrap();
        let queue: Arc<DispatchQueue<()>> = Arc::new(DispatchQueue::new(waker));
        let handles = HandleAllocator::new();
        let h = handles.alloc();

        let submitter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.submit(PendingChange::new(h, ChangeKind::Close)).unwrap();
            })
        };

        // Blocks without timeout: only the wake can end this wait.
        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, None).unwrap();
        assert!(events.iter().any(|e| e.token() == WAKER_TOKEN));
        assert_eq!(queue.drain().len(), 1);

        submitter.join().unwrap();
    }
}
