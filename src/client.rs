//! Load-generating client.
//!
//! One reactor thread multiplexes every connection of the process. Each
//! connection is driven by its own producer thread running a `Session`:
//! generate a payload, remember its expected hash, send it, block until
//! the reactor hands back the response, compare, sleep, repeat.
//!
//! Only one request is ever outstanding per connection, so responses are
//! matched against expected hashes in strict FIFO order.

use crate::config::ClientConfig;
use crate::hash::{generate_payload, sha1_hex, HashFn, HASH_RESPONSE_LEN, PAYLOAD_SIZE};
use crate::runtime::{CloseReason, ConnHandle, Protocol, Reactor, ReactorHandle};
use crate::stats::{format_uptime, ClientStats, Reporter};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// How often a blocked producer re-checks for shutdown.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Expected hashes of payloads sent but not yet acknowledged.
#[derive(Debug, Default)]
pub struct PendingHashes {
    queue: VecDeque<String>,
}

impl PendingHashes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hash: String) {
        self.queue.push_back(hash);
    }

    /// Remove the oldest expected hash.
    pub fn pop(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Reactor side of a one-shot response handoff.
#[derive(Debug)]
pub struct ResponseHandler {
    tx: SyncSender<Bytes>,
}

impl ResponseHandler {
    /// Deliver the response. Consumes the handler, so it fires at most once.
    pub fn fulfil(self, response: Bytes) {
        // The waiter may have given up already
        let _ = self.tx.try_send(response);
    }
}

/// Producer side of a one-shot response handoff.
#[derive(Debug)]
pub struct ResponseWaiter {
    rx: Receiver<Bytes>,
}

impl ResponseWaiter {
    /// Block until the response arrives.
    ///
    /// Returns `None` if the handler was dropped unfulfilled or `cancelled`
    /// starts returning true.
    pub fn wait<F>(self, cancelled: F) -> Option<Bytes>
    where
        F: Fn() -> bool,
    {
        loop {
            match self.rx.recv_timeout(WAIT_SLICE) {
                Ok(response) => return Some(response),
                Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) if cancelled() => return None,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

/// Create a connected handler and waiter.
pub fn response_channel() -> (ResponseHandler, ResponseWaiter) {
    let (tx, rx) = mpsc::sync_channel(1);
    (ResponseHandler { tx }, ResponseWaiter { rx })
}

/// The outstanding handler of one connection, shared by its producer and
/// the reactor.
#[derive(Debug, Default)]
pub struct ResponseSlot {
    state: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    handler: Option<ResponseHandler>,
    closed: bool,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh handler and return its waiter.
    ///
    /// Must happen before the request is sent so the response cannot race
    /// past an empty slot. On a closed slot the waiter fails immediately.
    pub fn install(&self) -> ResponseWaiter {
        let (handler, waiter) = response_channel();
        let mut state = self.lock();
        if !state.closed {
            state.handler = Some(handler);
        }
        waiter
    }

    /// Hand `response` to the outstanding handler.
    ///
    /// Returns false if nothing was waiting.
    pub fn fulfil(&self, response: Bytes) -> bool {
        match self.lock().handler.take() {
            Some(handler) => {
                handler.fulfil(response);
                true
            }
            None => false,
        }
    }

    /// Mark the connection closed, failing the outstanding waiter.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.handler = None;
    }

    pub fn is_waiting(&self) -> bool {
        self.lock().handler.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Per-connection client state held by the reactor.
pub type ClientSession = Arc<ResponseSlot>;

/// Reactor hooks for the client role.
#[derive(Debug, Default)]
pub struct ClientProtocol;

impl Protocol for ClientProtocol {
    type Session = ClientSession;

    fn frame_len(&self) -> usize {
        HASH_RESPONSE_LEN
    }

    fn on_connect(&mut self, handle: ConnHandle, _session: &mut ClientSession) {
        debug!(conn = %handle, "Connected to server");
    }

    fn on_frame(&mut self, handle: ConnHandle, session: &mut ClientSession, frame: Bytes) {
        if !session.fulfil(frame) {
            warn!(conn = %handle, "Unsolicited response dropped");
        }
    }

    fn on_close(&mut self, handle: ConnHandle, session: ClientSession, reason: CloseReason) {
        if session.is_waiting() {
            debug!(conn = %handle, ?reason, "Connection closed with a request outstanding");
        }
        session.close();
    }
}

/// Result of one request/response cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The response equals the expected hash.
    Matched,
    /// The response differs from the expected hash.
    Mismatch { expected: String, received: String },
    /// The connection failed before a response arrived.
    ConnectionLost,
}

/// Single-request-at-a-time driver of one connection.
pub struct Session {
    id: usize,
    server: SocketAddr,
    reactor: ReactorHandle<ClientSession>,
    stats: Arc<ClientStats>,
    hash: HashFn,
    interval: Duration,
    conn: Option<(ConnHandle, ClientSession)>,
    pending: PendingHashes,
    sent: u64,
}

impl Session {
    pub fn new(
        id: usize,
        server: SocketAddr,
        reactor: ReactorHandle<ClientSession>,
        stats: Arc<ClientStats>,
        hash: HashFn,
        interval: Duration,
    ) -> Self {
        Self {
            id,
            server,
            reactor,
            stats,
            hash,
            interval,
            conn: None,
            pending: PendingHashes::new(),
            sent: 0,
        }
    }

    /// Number of messages sent so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Expected hashes not yet acknowledged.
    pub fn pending(&self) -> &PendingHashes {
        &self.pending
    }

    /// Send one payload and verify its acknowledgement.
    ///
    /// Errors only when the reactor has shut down.
    pub fn send_message(&mut self) -> io::Result<Outcome> {
        let (handle, slot) = match self.connection() {
            Ok(conn) => conn,
            Err(e) if self.reactor.is_shutdown() => return Err(e),
            Err(e) => {
                warn!(session = self.id, server = %self.server, error = %e, "Connect failed");
                self.stats.response_lost();
                return Ok(Outcome::ConnectionLost);
            }
        };

        let payload = generate_payload(PAYLOAD_SIZE);
        self.pending.push((self.hash)(&payload));

        let waiter = slot.install();
        if let Err(e) = self.reactor.send(handle, payload) {
            slot.close();
            self.pending.pop();
            return Err(e);
        }
        self.sent += 1;
        self.stats.message_sent();
        trace!(session = self.id, conn = %handle, message = self.sent, "Payload sent");

        let reactor = &self.reactor;
        let Some(response) = waiter.wait(|| reactor.is_shutdown()) else {
            // The expected hash for the lost request can never be matched
            self.pending.pop();
            self.conn = None;
            let _ = self.reactor.close(handle);
            self.stats.response_lost();
            debug!(session = self.id, conn = %handle, "Response lost");
            return Ok(Outcome::ConnectionLost);
        };

        let received = String::from_utf8_lossy(&response).into_owned();
        let expected = self.pending.pop().unwrap_or_default();
        if expected == received {
            self.stats.hash_matched();
            debug!(session = self.id, message = self.sent, hash = %received, "Hash verified");
            return Ok(Outcome::Matched);
        }

        self.stats.hash_mismatched();
        error!(
            session = self.id,
            message = self.sent,
            expected = %expected,
            received = %received,
            "Hash mismatch"
        );
        Ok(Outcome::Mismatch { expected, received })
    }

    /// Run request cycles until shutdown or until `limit` cycles ran.
    ///
    /// A cycle that could not connect still counts towards the limit.
    pub fn run(&mut self, limit: Option<u64>) -> io::Result<()> {
        debug!(session = self.id, ?limit, "Session started");

        let mut cycles = 0u64;
        while !self.reactor.is_shutdown() && limit.map_or(true, |limit| cycles < limit) {
            cycles += 1;
            match self.send_message() {
                Ok(_) => {}
                Err(_) if self.reactor.is_shutdown() => break,
                Err(e) => return Err(e),
            }
            thread::sleep(self.interval);
        }

        if let Some((handle, _)) = self.conn.take() {
            let _ = self.reactor.close(handle);
        }
        debug!(session = self.id, sent = self.sent, "Session finished");
        Ok(())
    }

    /// Current connection, opening a new one if there is none.
    fn connection(&mut self) -> io::Result<(ConnHandle, ClientSession)> {
        if let Some((handle, slot)) = &self.conn {
            return Ok((*handle, Arc::clone(slot)));
        }

        // A fresh slot per connection keeps a late close of the previous
        // connection from failing the new waiter.
        let slot = Arc::new(ResponseSlot::new());
        let handle = self.reactor.connect(self.server, Arc::clone(&slot))?;
        debug!(session = self.id, conn = %handle, server = %self.server, "Connecting");
        self.conn = Some((handle, Arc::clone(&slot)));
        Ok((handle, slot))
    }
}

/// Client instance: a reactor thread plus one producer per connection.
pub struct Client {
    config: ClientConfig,
    server: SocketAddr,
    hash: HashFn,
    reactor: ReactorHandle<ClientSession>,
    stats: Arc<ClientStats>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl Client {
    /// Resolve the server and start the reactor thread, verifying with SHA-1.
    pub fn connect(config: &ClientConfig) -> io::Result<Self> {
        Self::with_hash(config, sha1_hex)
    }

    /// Start with a custom expected-hash function.
    pub fn with_hash(config: &ClientConfig, hash: HashFn) -> io::Result<Self> {
        let server = config.server_addr()?;
        let (mut reactor, handle) = Reactor::new(config.connections)?;

        let thread = thread::Builder::new()
            .name("client-reactor".to_string())
            .spawn(move || {
                let result = reactor.run(&mut ClientProtocol);
                if let Err(ref e) = result {
                    error!(error = %e, "Client reactor failed");
                }
                result
            })?;

        Ok(Self {
            config: config.clone(),
            server,
            hash,
            reactor: handle,
            stats: Arc::new(ClientStats::new()),
            thread: Some(thread),
        })
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        Arc::clone(&self.stats)
    }

    /// Build a session driving one connection to the server.
    pub fn session(&self, id: usize) -> Session {
        Session::new(
            id,
            self.server,
            self.reactor.clone(),
            Arc::clone(&self.stats),
            self.hash,
            self.config.send_interval(),
        )
    }

    /// Run `connections` sessions until each reaches the message limit or
    /// the client is shut down.
    pub fn run(&self) -> io::Result<()> {
        info!(
            server = %self.server,
            connections = self.config.connections,
            rate = self.config.rate,
            messages = ?self.config.messages,
            "Client started"
        );

        let reporter = match self.config.stats_interval() {
            Some(interval) => Some(self.spawn_reporter(interval)?),
            None => None,
        };

        let mut producers = Vec::with_capacity(self.config.connections);
        for id in 0..self.config.connections {
            let mut session = self.session(id);
            let limit = self.config.messages;
            let producer = thread::Builder::new()
                .name(format!("producer-{id}"))
                .spawn(move || session.run(limit));
            match producer {
                Ok(producer) => producers.push(producer),
                Err(e) => {
                    self.shutdown();
                    return Err(e);
                }
            }
        }

        let mut result = Ok(());
        for producer in producers {
            match producer.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "Session failed");
                    result = Err(e);
                }
                Err(_) => error!("Producer thread panicked"),
            }
        }

        if let Some(reporter) = reporter {
            reporter.stop();
        }
        info!(
            sent = self.stats.sent(),
            matched = self.stats.matched(),
            mismatched = self.stats.mismatched(),
            lost = self.stats.lost(),
            "Client finished"
        );
        result
    }

    /// Stop every session and the reactor.
    pub fn shutdown(&self) {
        self.reactor.shutdown();
    }

    fn spawn_reporter(&self, interval: Duration) -> io::Result<Reporter> {
        let stats = Arc::clone(&self.stats);
        Reporter::spawn("client-stats", interval, move || {
            info!(
                sent = stats.sent(),
                matched = stats.matched(),
                mismatched = stats.mismatched(),
                lost = stats.lost(),
                messages_per_second = stats.messages_per_second(),
                uptime = %format_uptime(stats.uptime()),
                "Client stats"
            );
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reactor.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::{Server, ServerSession};
    use std::net::TcpListener;
    use std::time::Instant;

    struct TestServer {
        addr: SocketAddr,
        handle: ReactorHandle<ServerSession>,
        thread: Option<JoinHandle<io::Result<()>>>,
    }

    impl TestServer {
        fn start(pool_size: usize, hash: HashFn) -> Self {
            let mut config = ServerConfig::new(0, pool_size);
            config.host = "127.0.0.1".to_string();
            config.stats_interval = 0;

            let server = Server::with_hash(&config, hash).unwrap();
            let addr = server.local_addr();
            let handle = server.handle();
            let thread = thread::spawn(move || server.run());
            Self {
                addr,
                handle,
                thread: Some(thread),
            }
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.handle.shutdown();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn client_config(addr: SocketAddr, connections: usize, messages: u64) -> ClientConfig {
        let mut config = ClientConfig::new(addr.ip().to_string(), addr.port(), 1000);
        config.connections = connections;
        config.messages = Some(messages);
        config.stats_interval = 0;
        config
    }

    fn reversed_sha1(data: &[u8]) -> String {
        sha1_hex(data).chars().rev().collect()
    }

    #[test]
    fn test_pending_hashes_fifo() {
        let mut pending = PendingHashes::new();
        assert!(pending.pop().is_none());

        pending.push("a".to_string());
        pending.push("b".to_string());
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.pop().as_deref(), Some("a"));
        assert_eq!(pending.pop().as_deref(), Some("b"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_response_handler_fulfils_waiter() {
        let (handler, waiter) = response_channel();
        let fulfiller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handler.fulfil(Bytes::from_static(b"hash"));
        });

        assert_eq!(waiter.wait(|| false), Some(Bytes::from_static(b"hash")));
        fulfiller.join().unwrap();
    }

    #[test]
    fn test_dropped_handler_releases_waiter() {
        let (handler, waiter) = response_channel();
        drop(handler);
        assert_eq!(waiter.wait(|| false), None);
    }

    #[test]
    fn test_cancelled_wait_returns() {
        let (_handler, waiter) = response_channel();
        let started = Instant::now();
        assert_eq!(waiter.wait(|| started.elapsed() > Duration::from_millis(50)), None);
    }

    #[test]
    fn test_response_slot() {
        let slot = ResponseSlot::new();
        assert!(!slot.fulfil(Bytes::from_static(b"early")));

        let waiter = slot.install();
        assert!(slot.is_waiting());
        assert!(slot.fulfil(Bytes::from_static(b"first")));
        assert!(!slot.is_waiting());
        assert_eq!(waiter.wait(|| false), Some(Bytes::from_static(b"first")));

        let waiter = slot.install();
        slot.close();
        assert_eq!(waiter.wait(|| false), None);

        // A connection that closed before the request was installed
        assert!(slot.is_closed());
        assert_eq!(slot.install().wait(|| false), None);
    }

    #[test]
    fn test_all_connections_verify_in_order() {
        let server = TestServer::start(2, sha1_hex);
        let client = Client::connect(&client_config(server.addr, 3, 5)).unwrap();

        client.run().unwrap();

        let stats = client.stats();
        assert_eq!(stats.sent(), 15);
        assert_eq!(stats.matched(), 15);
        assert_eq!(stats.mismatched(), 0);
        assert_eq!(stats.lost(), 0);
    }

    #[test]
    fn test_session_reuses_connection() {
        let server = TestServer::start(1, sha1_hex);
        let client = Client::connect(&client_config(server.addr, 1, 3)).unwrap();
        let mut session = client.session(0);

        for _ in 0..3 {
            assert_eq!(session.send_message().unwrap(), Outcome::Matched);
        }
        let first = session.conn.as_ref().map(|(handle, _)| *handle);
        assert_eq!(session.send_message().unwrap(), Outcome::Matched);
        assert_eq!(session.conn.as_ref().map(|(handle, _)| *handle), first);
        assert_eq!(session.sent(), 4);
        assert!(session.pending().is_empty());
    }

    #[test]
    fn test_mismatch_reported_and_session_continues() {
        let server = TestServer::start(1, reversed_sha1);
        let client = Client::connect(&client_config(server.addr, 1, 2)).unwrap();
        let mut session = client.session(0);

        for _ in 0..2 {
            match session.send_message().unwrap() {
                Outcome::Mismatch { expected, received } => {
                    assert_eq!(received, expected.chars().rev().collect::<String>());
                }
                other => panic!("expected mismatch, got {other:?}"),
            }
        }
        assert_eq!(client.stats().mismatched(), 2);
        assert!(session.pending().is_empty());
    }

    #[test]
    fn test_connection_lost_discards_expected_hash() {
        // Accepts and immediately hangs up
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let client = Client::connect(&client_config(addr, 1, 1)).unwrap();
        let mut session = client.session(0);

        assert_eq!(session.send_message().unwrap(), Outcome::ConnectionLost);
        assert!(session.pending().is_empty());
        assert!(session.conn.is_none());
        assert_eq!(client.stats().lost(), 1);
        acceptor.join().unwrap();
    }

    #[test]
    fn test_connect_failure_does_not_end_session() {
        // Nothing listens on this port once the listener is dropped
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let client = Client::connect(&client_config(addr, 1, 2)).unwrap();
        let mut session = client.session(0);

        assert_eq!(session.send_message().unwrap(), Outcome::ConnectionLost);
        assert_eq!(session.send_message().unwrap(), Outcome::ConnectionLost);
        assert!(session.pending().is_empty());
    }

    #[test]
    fn test_shutdown_stops_sessions() {
        let server = TestServer::start(1, sha1_hex);
        let mut config = client_config(server.addr, 2, 0);
        config.messages = None;
        config.rate = 10;
        let client = Arc::new(Client::connect(&config).unwrap());

        let runner = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.run())
        };
        thread::sleep(Duration::from_millis(300));
        client.shutdown();

        runner.join().unwrap().unwrap();
        assert!(client.stats().matched() >= 2);
        assert!(session_send_fails_after_shutdown(&client));
    }

    fn session_send_fails_after_shutdown(client: &Client) -> bool {
        client.session(9).send_message().is_err()
    }
}
