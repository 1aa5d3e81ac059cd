//! Connection handles and their mapping onto mio tokens.
//!
//! Handles are allocated from a shared counter so any thread can name a
//! connection before the reactor has registered it. They are never reused,
//! which makes a handle held by a worker after the connection closed
//! harmless: the reactor simply no longer knows it.

use mio::Token;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Token for the listener socket.
pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token for the cross-thread waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Opaque identifier of one connection owned by a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnHandle(usize);

impl ConnHandle {
    /// The mio token this connection is registered under.
    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }

    /// Map a mio token back to a handle.
    ///
    /// Returns `None` for the reserved listener and waker tokens.
    pub(crate) fn from_token(token: Token) -> Option<Self> {
        if token == LISTENER_TOKEN || token == WAKER_TOKEN {
            None
        } else {
            Some(ConnHandle(token.0))
        }
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Allocator for connection handles, shared between threads.
#[derive(Debug, Default)]
pub(crate) struct HandleAllocator {
    next: AtomicUsize,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh handle. Never returns a handle twice.
    pub fn alloc(&self) -> ConnHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        debug_assert!(id < WAKER_TOKEN.0, "connection handle space exhausted");
        ConnHandle(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let alloc = HandleAllocator::new();

        let h1 = alloc.alloc();
        let h2 = alloc.alloc();
        assert_ne!(h1, h2);
        assert!(h1 < h2);
    }

    #[test]
    fn test_token_round_trip_and_reserved_tokens() {
        let alloc = HandleAllocator::new();
        let handle = alloc.alloc();

        assert_eq!(ConnHandle::from_token(handle.token()), Some(handle));
        assert!(ConnHandle::from_token(LISTENER_TOKEN).is_none());
        assert!(ConnHandle::from_token(WAKER_TOKEN).is_none());
        assert_eq!(handle.to_string(), "conn-0");
    }
}
