//! Connection state machine for reactor-owned TCP connections.
//!
//! Each connection tracks whether its outbound connect is still pending,
//! the interest it is registered with, its inbound frame accumulator,
//! its outbound write queue, and the protocol's per-connection session.

use crate::runtime::buffer::{FrameBuffer, WriteQueue};
use crate::runtime::token::ConnHandle;
use mio::net::TcpStream;
use mio::Interest;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Outbound connect issued, completion not yet observed.
    Connecting,
    /// Established; reading and writing frames.
    Open,
}

/// A single connection owned by a reactor.
#[derive(Debug)]
pub struct Connection<S> {
    /// Non-blocking socket.
    pub stream: TcpStream,
    /// Current lifecycle state.
    pub state: ConnState,
    /// Interest requested by the protocol (read or write).
    pub interest: Interest,
    /// Partial inbound frame.
    pub read_buf: FrameBuffer,
    /// Pending outbound buffers.
    pub write_queue: WriteQueue,
    /// Remote address, once known.
    pub peer: Option<SocketAddr>,
    /// Protocol session state.
    pub session: S,
}

impl<S> Connection<S> {
    /// Create an outbound connection awaiting connect completion.
    pub fn connecting(stream: TcpStream, frame_len: usize, session: S) -> Self {
        Self {
            stream,
            state: ConnState::Connecting,
            interest: Interest::READABLE,
            read_buf: FrameBuffer::new(frame_len),
            write_queue: WriteQueue::new(),
            peer: None,
            session,
        }
    }

    /// Create an established (accepted) connection in reading state.
    pub fn accepted(stream: TcpStream, peer: SocketAddr, frame_len: usize, session: S) -> Self {
        Self {
            stream,
            state: ConnState::Open,
            interest: Interest::READABLE,
            read_buf: FrameBuffer::new(frame_len),
            write_queue: WriteQueue::new(),
            peer: Some(peer),
            session,
        }
    }

    /// Interest to register with the poller.
    ///
    /// Connect completion is reported as writability, so a connecting
    /// socket always includes WRITABLE whatever the protocol requested.
    pub fn effective_interest(&self) -> Interest {
        match self.state {
            ConnState::Connecting => self.interest | Interest::WRITABLE,
            ConnState::Open => self.interest,
        }
    }

    /// Transition to open once the connect completed.
    pub fn established(&mut self, peer: SocketAddr) {
        self.state = ConnState::Open;
        self.peer = Some(peer);
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnState::Connecting
    }
}

/// Registry of live connections keyed by handle.
pub struct ConnectionRegistry<S> {
    connections: HashMap<ConnHandle, Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a connection under `handle`.
    ///
    /// Gives the connection back if the registry is at capacity.
    pub fn insert(&mut self, handle: ConnHandle, conn: Connection<S>) -> Result<(), Connection<S>> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        self.connections.insert(handle, conn);
        Ok(())
    }

    pub fn get(&self, handle: ConnHandle) -> Option<&Connection<S>> {
        self.connections.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ConnHandle) -> Option<&mut Connection<S>> {
        self.connections.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: ConnHandle) -> Option<Connection<S>> {
        self.connections.remove(&handle)
    }

    pub fn contains(&self, handle: ConnHandle) -> bool {
        self.connections.contains_key(&handle)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Handles of every live connection.
    pub fn handles(&self) -> Vec<ConnHandle> {
        self.connections.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::token::HandleAllocator;

    fn loopback_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    #[test]
    fn test_connection_state_transitions() {
        let (stream, _peer) = loopback_pair();
        let mut conn = Connection::connecting(stream, 8, ());

        assert!(conn.is_connecting());
        assert_eq!(conn.effective_interest(), Interest::READABLE | Interest::WRITABLE);

        conn.established("127.0.0.1:9".parse().unwrap());
        assert_eq!(conn.state, ConnState::Open);
        assert_eq!(conn.effective_interest(), Interest::READABLE);

        conn.interest = Interest::WRITABLE;
        assert_eq!(conn.effective_interest(), Interest::WRITABLE);
    }

    #[test]
    fn test_connection_registry() {
        let handles = HandleAllocator::new();
        let mut registry = ConnectionRegistry::new(2);
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let (s1, _p1) = loopback_pair();
        let (s2, _p2) = loopback_pair();
        let (s3, _p3) = loopback_pair();

        let h1 = handles.alloc();
        let h2 = handles.alloc();
        let h3 = handles.alloc();

        assert!(registry.insert(h1, Connection::accepted(s1, peer, 8, 1u8)).is_ok());
        assert!(registry.insert(h2, Connection::accepted(s2, peer, 8, 2u8)).is_ok());

        // At capacity
        assert!(registry.insert(h3, Connection::accepted(s3, peer, 8, 3u8)).is_err());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(h2).unwrap().session, 2);

        registry.remove(h1);
        assert!(!registry.contains(h1));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.handles(), vec![h2]);
    }
}
