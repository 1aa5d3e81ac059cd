//! Hashing server.
//!
//! The reactor thread reads fixed-size payloads and hands each one to the
//! worker pool. A worker hashes the payload, publishes the message
//! metadata for the stats reporter, then queues the hex digest back onto
//! the originating connection through the reactor handle.

use crate::config::ServerConfig;
use crate::hash::{sha1_hex, HashFn, PAYLOAD_SIZE};
use crate::pool::{PoolStatus, TaskHandler, ThreadPoolManager, WorkerId};
use crate::runtime::{CloseReason, ConnHandle, Protocol, Reactor, ReactorHandle};
use crate::stats::{format_uptime, MessageInfo, Reporter, ServerStats};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Unit of work executed on the pool.
#[derive(Debug)]
pub enum Task {
    /// Hash a payload and answer the connection it came from.
    Inbound {
        handle: ConnHandle,
        client: Arc<str>,
        payload: Bytes,
    },
    /// Queue a finished response for writing.
    Outbound { handle: ConnHandle, response: Bytes },
}

/// Executes server tasks on pool workers.
pub struct HashExecutor {
    reactor: ReactorHandle<ServerSession>,
    hash: HashFn,
    messages: Sender<MessageInfo>,
}

impl HashExecutor {
    pub fn new(
        reactor: ReactorHandle<ServerSession>,
        hash: HashFn,
        messages: Sender<MessageInfo>,
    ) -> Self {
        Self {
            reactor,
            hash,
            messages,
        }
    }
}

impl TaskHandler<Task> for HashExecutor {
    fn execute(&self, worker: WorkerId, task: Task) {
        match task {
            Task::Inbound {
                handle,
                client,
                payload,
            } => {
                let hash = (self.hash)(&payload);
                trace!(conn = %handle, worker, hash = %hash, "Payload hashed");

                // Nobody listens when reporting is disabled
                let _ = self.messages.send(MessageInfo {
                    client: client.to_string(),
                    hash: hash.clone(),
                    worker,
                });

                self.execute(
                    worker,
                    Task::Outbound {
                        handle,
                        response: Bytes::from(hash.into_bytes()),
                    },
                );
            }
            Task::Outbound { handle, response } => {
                if let Err(e) = self.reactor.send(handle, response) {
                    debug!(conn = %handle, error = %e, "Dropping response");
                }
            }
        }
    }
}

/// Per-connection server state.
#[derive(Debug)]
pub struct ServerSession {
    client: Arc<str>,
}

impl ServerSession {
    /// Name of the connected client.
    pub fn client(&self) -> &str {
        &self.client
    }
}

type HashPool = ThreadPoolManager<Task, HashExecutor>;

/// Reactor hooks for the server role.
pub struct ServerProtocol {
    pool: Arc<HashPool>,
    stats: Arc<ServerStats>,
}

impl Protocol for ServerProtocol {
    type Session = ServerSession;

    fn frame_len(&self) -> usize {
        PAYLOAD_SIZE
    }

    fn on_accept(&mut self, handle: ConnHandle, peer: SocketAddr) -> Option<ServerSession> {
        self.stats.client_connected();
        let client: Arc<str> = peer.ip().to_string().into();
        info!(conn = %handle, client = %client, "Client connected");
        Some(ServerSession { client })
    }

    fn on_frame(&mut self, handle: ConnHandle, session: &mut ServerSession, frame: Bytes) {
        self.stats.packet_received();
        let task = Task::Inbound {
            handle,
            client: Arc::clone(&session.client),
            payload: frame,
        };
        if let Err(e) = self.pool.submit(task) {
            warn!(conn = %handle, error = %e, "Dropping payload");
        }
    }

    fn on_close(&mut self, handle: ConnHandle, session: ServerSession, reason: CloseReason) {
        debug!(conn = %handle, client = %session.client, ?reason, "Client disconnected");
    }
}

/// Server instance
pub struct Server {
    config: ServerConfig,
    reactor: Reactor<ServerSession>,
    protocol: ServerProtocol,
    pool: Arc<HashPool>,
    stats: Arc<ServerStats>,
    messages: Option<Receiver<MessageInfo>>,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the listener and build the worker pool, hashing with SHA-1.
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        Self::with_hash(config, sha1_hex)
    }

    /// Bind with a custom hash function.
    pub fn with_hash(config: &ServerConfig, hash: HashFn) -> io::Result<Self> {
        let (mut reactor, handle) = Reactor::new(config.max_connections)?;
        let local_addr = reactor.listen(config.listen_addr()?)?;

        let (tx, rx) = mpsc::channel();
        let pool = Arc::new(ThreadPoolManager::new(
            config.pool_size,
            HashExecutor::new(handle, hash, tx),
        ));
        let stats = Arc::new(ServerStats::new());

        let protocol = ServerProtocol {
            pool: Arc::clone(&pool),
            stats: Arc::clone(&stats),
        };

        Ok(Self {
            config: config.clone(),
            reactor,
            protocol,
            pool,
            stats,
            messages: Some(rx),
            local_addr,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for shutting the server down from another thread.
    pub fn handle(&self) -> ReactorHandle<ServerSession> {
        self.reactor.handle()
    }

    /// Make a running `run` return. Equivalent to `handle().shutdown()`.
    pub fn shutdown(&self) {
        self.reactor.handle().shutdown();
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Take the stream of handled messages.
    ///
    /// The periodic reporter is disabled once this is taken.
    pub fn take_messages(&mut self) -> Option<Receiver<MessageInfo>> {
        self.messages.take()
    }

    /// Start the pool and run the reactor until shutdown.
    pub fn run(mut self) -> io::Result<()> {
        self.pool.start()?;
        info!(
            addr = %self.local_addr,
            pool_size = self.config.pool_size,
            started_at = %self.stats.started_at().format("%Y-%m-%d %H:%M:%S"),
            "Server started"
        );

        let reporter = match (self.config.stats_interval(), self.messages.take()) {
            (Some(interval), Some(messages)) => Some(self.spawn_reporter(interval, messages)?),
            _ => None,
        };

        let result = self.reactor.run(&mut self.protocol);

        if let Some(reporter) = reporter {
            reporter.stop();
        }
        let discarded = self.pool.stop();
        info!(discarded, "Server stopped");
        result
    }

    fn spawn_reporter(
        &self,
        interval: std::time::Duration,
        messages: Receiver<MessageInfo>,
    ) -> io::Result<Reporter> {
        let stats = Arc::clone(&self.stats);
        let pool = Arc::clone(&self.pool);
        let addr = self.local_addr;

        Reporter::spawn("server-stats", interval, move || {
            let status = pool.status();
            info!(
                addr = %addr,
                clients = stats.clients_connected(),
                packets = stats.packets(),
                packets_per_second = stats.packets_per_second(),
                busy = status.busy,
                queued = status.queued,
                uptime = %format_uptime(stats.uptime()),
                "Server stats"
            );
            for message in messages.try_iter() {
                info!(
                    client = %message.client,
                    hash = %message.hash,
                    worker = message.worker,
                    "Message handled"
                );
            }
        })
    }
}
