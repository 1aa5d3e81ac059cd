//! mio reactor implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Threading
//!
//! A `Reactor` is driven by exactly one thread. Other threads hold a
//! `ReactorHandle` and never touch connections directly: they queue a
//! `PendingChange` and wake the poller. Each loop iteration first applies
//! every queued change in FIFO order, then blocks for readiness.

use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::dispatch::{ChangeKind, DispatchQueue, PendingChange};
use crate::runtime::protocol::{CloseReason, Protocol};
use crate::runtime::token::{ConnHandle, HandleAllocator, LISTENER_TOKEN, WAKER_TOKEN};
use crate::runtime::FlushStatus;
use bytes::Bytes;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Maximum events to process per poll.
const MAX_EVENTS: usize = 1024;

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 1024;

/// State shared between the reactor thread and its handles.
struct Shared<S> {
    dispatch: DispatchQueue<S>,
    handles: HandleAllocator,
    shutdown: AtomicBool,
}

/// Thread-safe handle for submitting work to a reactor.
pub struct ReactorHandle<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for ReactorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> ReactorHandle<S> {
    /// Queue a change for the reactor thread and wake it.
    ///
    /// Fails once shutdown was requested: nothing would apply the change.
    pub fn submit(&self, change: PendingChange<S>) -> io::Result<()> {
        if self.is_shutdown() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "reactor shut down"));
        }
        self.shared.dispatch.submit(change)
    }

    /// Queue `data` for writing on `handle`.
    ///
    /// The buffer is appended to the connection's write queue and write
    /// interest is requested in the same change, so the two can never be
    /// observed apart.
    pub fn send(&self, handle: ConnHandle, data: impl Into<Bytes>) -> io::Result<()> {
        self.submit(PendingChange::new(handle, ChangeKind::Write(data.into())))
    }

    /// Replace the interest of `handle`.
    pub fn set_interest(&self, handle: ConnHandle, interest: Interest) -> io::Result<()> {
        self.submit(PendingChange::new(handle, ChangeKind::ChangeInterest(interest)))
    }

    /// Close `handle`.
    pub fn close(&self, handle: ConnHandle) -> io::Result<()> {
        self.submit(PendingChange::new(handle, ChangeKind::Close))
    }

    /// Start a non-blocking connect to `addr` and queue its registration.
    ///
    /// The handle is usable immediately: writes queued before the connect
    /// completes are flushed once it does.
    pub fn connect(&self, addr: SocketAddr, session: S) -> io::Result<ConnHandle> {
        let stream = TcpStream::connect(addr)?;
        let handle = self.shared.handles.alloc();
        self.submit(PendingChange::new(handle, ChangeKind::Register { stream, session }))?;
        Ok(handle)
    }

    /// Ask the reactor to close every connection and return from `run`.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.shared.dispatch.wake() {
            warn!(error = %e, "Failed to wake reactor for shutdown");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

/// Single-threaded connection multiplexer.
pub struct Reactor<S> {
    poll: Poll,
    connections: ConnectionRegistry<S>,
    listener: Option<TcpListener>,
    shared: Arc<Shared<S>>,
}

impl<S: Send + 'static> Reactor<S> {
    /// Create a reactor and a handle to it.
    ///
    /// Fails only if the OS poller or waker cannot be created.
    pub fn new(max_connections: usize) -> io::Result<(Self, ReactorHandle<S>)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            dispatch: DispatchQueue::new(waker),
            handles: HandleAllocator::new(),
            shutdown: AtomicBool::new(false),
        });

        let reactor = Self {
            poll,
            connections: ConnectionRegistry::new(max_connections),
            listener: None,
            shared: Arc::clone(&shared),
        };

        Ok((reactor, ReactorHandle { shared }))
    }

    /// Bind a listener and accept connections on it.
    ///
    /// Returns the bound address, which resolves port 0.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local = listener.local_addr()?;
        self.listener = Some(listener);
        info!(addr = %local, "Listening");
        Ok(local)
    }

    pub fn handle(&self) -> ReactorHandle<S> {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Look up a live connection.
    pub fn connection(&self, handle: ConnHandle) -> Option<&Connection<S>> {
        self.connections.get(handle)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until `ReactorHandle::shutdown` is called.
    ///
    /// Only failure of the poller itself is returned as an error;
    /// per-connection failures close that connection and carry on.
    pub fn run<P>(&mut self, protocol: &mut P) -> io::Result<()>
    where
        P: Protocol<Session = S>,
    {
        let mut events = Events::with_capacity(MAX_EVENTS);

        debug!("Reactor started");
        while !self.shared.shutdown.load(Ordering::Acquire) {
            self.turn(protocol, &mut events, None)?;
        }

        self.close_all(protocol);
        debug!("Reactor stopped");
        Ok(())
    }

    /// One loop iteration: apply pending changes, wait, dispatch events.
    pub fn turn<P>(
        &mut self,
        protocol: &mut P,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> io::Result<()>
    where
        P: Protocol<Session = S>,
    {
        self.apply_pending_changes(protocol);

        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            match event.token() {
                // Changes are applied at the top of the next iteration.
                WAKER_TOKEN => trace!("Reactor woken"),
                LISTENER_TOKEN => self.accept_connections(protocol),
                token => {
                    let Some(handle) = ConnHandle::from_token(token) else {
                        continue;
                    };
                    if let Err(reason) = self.handle_connection_event(handle, event, protocol) {
                        self.close_connection(handle, reason, protocol);
                    }
                }
            }
        }

        Ok(())
    }

    /// Apply every queued change in FIFO order.
    pub fn apply_pending_changes<P>(&mut self, protocol: &mut P)
    where
        P: Protocol<Session = S>,
    {
        for change in self.shared.dispatch.drain() {
            self.apply_change(change, protocol);
        }
    }

    fn apply_change<P>(&mut self, change: PendingChange<S>, protocol: &mut P)
    where
        P: Protocol<Session = S>,
    {
        let PendingChange { target, kind } = change;

        let result = match kind {
            ChangeKind::Register { stream, session } => {
                self.register_outbound(target, stream, session, protocol);
                return;
            }
            ChangeKind::Close => Err(CloseReason::Requested),
            ChangeKind::ChangeInterest(interest) => {
                self.update_interest(target, |conn| conn.interest = interest)
            }
            ChangeKind::Write(data) => self.update_interest(target, |conn| {
                conn.write_queue.push(data);
                conn.interest = Interest::WRITABLE;
            }),
        };

        if let Err(reason) = result {
            self.close_connection(target, reason, protocol);
        }
    }

    /// Mutate a connection and re-register it with its new interest.
    ///
    /// Re-registering with an unchanged interest is harmless, so duplicate
    /// changes converge on the same state.
    fn update_interest<F>(&mut self, handle: ConnHandle, mutate: F) -> Result<(), CloseReason>
    where
        F: FnOnce(&mut Connection<S>),
    {
        let Some(conn) = self.connections.get_mut(handle) else {
            debug!(conn = %handle, "Change for closed connection dropped");
            return Ok(());
        };

        mutate(conn);
        let interest = conn.effective_interest();
        self.poll
            .registry()
            .reregister(&mut conn.stream, handle.token(), interest)
            .map_err(CloseReason::Io)
    }

    fn register_outbound<P>(
        &mut self,
        handle: ConnHandle,
        stream: TcpStream,
        session: S,
        protocol: &mut P,
    ) where
        P: Protocol<Session = S>,
    {
        if self.connections.len() >= self.connections.capacity() {
            warn!(conn = %handle, "Connection limit reached");
            let reason = io::Error::new(io::ErrorKind::Other, "connection limit reached");
            protocol.on_close(handle, session, CloseReason::ConnectFailed(reason));
            return;
        }

        let mut conn = Connection::connecting(stream, protocol.frame_len(), session);
        let interest = conn.effective_interest();

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, handle.token(), interest)
        {
            warn!(conn = %handle, error = %e, "Failed to register connection");
            protocol.on_close(handle, conn.session, CloseReason::ConnectFailed(e));
            return;
        }

        if let Err(conn) = self.connections.insert(handle, conn) {
            protocol.on_close(handle, conn.session, CloseReason::Shutdown);
            return;
        }
        debug!(conn = %handle, "Connecting");
    }

    fn accept_connections<P>(&mut self, protocol: &mut P)
    where
        P: Protocol<Session = S>,
    {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.connections.len() >= self.connections.capacity() {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    }

                    let handle = self.shared.handles.alloc();
                    let Some(session) = protocol.on_accept(handle, peer) else {
                        debug!(peer = %peer, "Connection rejected");
                        continue;
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(conn = %handle, error = %e, "Failed to set TCP_NODELAY");
                    }

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, handle.token(), Interest::READABLE)
                    {
                        warn!(conn = %handle, error = %e, "Failed to register connection");
                        protocol.on_close(handle, session, CloseReason::Io(e));
                        continue;
                    }

                    let conn = Connection::accepted(stream, peer, protocol.frame_len(), session);
                    if let Err(conn) = self.connections.insert(handle, conn) {
                        protocol.on_close(handle, conn.session, CloseReason::Shutdown);
                        continue;
                    }

                    debug!(conn = %handle, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event<P>(
        &mut self,
        handle: ConnHandle,
        event: &Event,
        protocol: &mut P,
    ) -> Result<(), CloseReason>
    where
        P: Protocol<Session = S>,
    {
        let Some(conn) = self.connections.get(handle) else {
            return Ok(());
        };

        if conn.is_connecting() {
            if event.is_writable() || event.is_error() || event.is_write_closed() {
                return self.finish_connect(handle, protocol);
            }
            return Ok(());
        }

        if event.is_readable() || event.is_read_closed() {
            self.handle_readable(handle, protocol)?;
        }

        // Re-check: the read handler may have queued or cleared writes
        if event.is_writable() && self.connections.contains(handle) {
            self.handle_writable(handle)?;
        }

        Ok(())
    }

    fn finish_connect<P>(&mut self, handle: ConnHandle, protocol: &mut P) -> Result<(), CloseReason>
    where
        P: Protocol<Session = S>,
    {
        let Some(conn) = self.connections.get_mut(handle) else {
            return Ok(());
        };

        match conn.stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => return Err(CloseReason::ConnectFailed(e)),
        }

        let peer = match conn.stream.peer_addr() {
            Ok(peer) => peer,
            // Spurious wakeup, still connecting
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
            Err(e) => return Err(CloseReason::ConnectFailed(e)),
        };

        conn.established(peer);
        if let Err(e) = conn.stream.set_nodelay(true) {
            debug!(conn = %handle, error = %e, "Failed to set TCP_NODELAY");
        }
        debug!(conn = %handle, peer = %peer, "Connected");
        protocol.on_connect(handle, &mut conn.session);

        if conn.write_queue.is_empty() {
            conn.interest = Interest::READABLE;
        } else {
            conn.interest = Interest::WRITABLE;
        }
        let interest = conn.effective_interest();
        self.poll
            .registry()
            .reregister(&mut conn.stream, handle.token(), interest)
            .map_err(CloseReason::Io)?;

        // The writable edge was consumed by the connect; flush now
        if interest.is_writable() {
            self.handle_writable(handle)?;
        }
        Ok(())
    }

    fn handle_readable<P>(&mut self, handle: ConnHandle, protocol: &mut P) -> Result<(), CloseReason>
    where
        P: Protocol<Session = S>,
    {
        let Some(conn) = self.connections.get_mut(handle) else {
            return Ok(());
        };

        // Edge-triggered: drain until the socket would block
        loop {
            match conn.read_buf.read_from(&mut conn.stream) {
                Ok(0) => return Err(CloseReason::PeerClosed),
                Ok(n) => {
                    trace!(conn = %handle, bytes = n, "Read");
                    if let Some(frame) = conn.read_buf.take_frame() {
                        protocol.on_frame(handle, &mut conn.session, frame);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CloseReason::Io(e)),
            }
        }
    }

    fn handle_writable(&mut self, handle: ConnHandle) -> Result<(), CloseReason> {
        let Some(conn) = self.connections.get_mut(handle) else {
            return Ok(());
        };

        match conn.write_queue.write_to(&mut conn.stream) {
            Ok(FlushStatus::Drained) => {
                // Done writing, switch back to reading
                if conn.interest != Interest::READABLE {
                    conn.interest = Interest::READABLE;
                    let interest = conn.effective_interest();
                    self.poll
                        .registry()
                        .reregister(&mut conn.stream, handle.token(), interest)
                        .map_err(CloseReason::Io)?;
                }
                Ok(())
            }
            Ok(FlushStatus::Blocked) => {
                trace!(
                    conn = %handle,
                    pending = conn.write_queue.pending_bytes(),
                    "Partial write"
                );
                Ok(())
            }
            Err(e) => Err(CloseReason::Io(e)),
        }
    }

    fn close_connection<P>(&mut self, handle: ConnHandle, reason: CloseReason, protocol: &mut P)
    where
        P: Protocol<Session = S>,
    {
        let Some(mut conn) = self.connections.remove(handle) else {
            return;
        };

        let _ = self.poll.registry().deregister(&mut conn.stream);

        match &reason {
            CloseReason::ConnectFailed(e) => warn!(conn = %handle, error = %e, "Connect failed"),
            CloseReason::Io(e) => debug!(conn = %handle, error = %e, "Connection error"),
            _ => debug!(conn = %handle, reason = ?reason, "Connection closed"),
        }

        protocol.on_close(handle, conn.session, reason);
    }

    fn close_all<P>(&mut self, protocol: &mut P)
    where
        P: Protocol<Session = S>,
    {
        for handle in self.connections.handles() {
            self.close_connection(handle, CloseReason::Shutdown, protocol);
        }
        // Changes that raced with shutdown still carry sessions to release
        for change in self.shared.dispatch.drain() {
            if let ChangeKind::Register { session, .. } = change.kind {
                protocol.on_close(change.target, session, CloseReason::Shutdown);
            }
        }
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
