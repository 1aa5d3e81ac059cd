//! Protocol hooks invoked by the reactor.
//!
//! The reactor knows nothing about payloads or hashes. It hands complete
//! fixed-size frames to a `Protocol` implementation and tells it when
//! connections come and go; everything else is protocol business.

use crate::runtime::token::ConnHandle;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;

/// Why a connection was closed by the reactor.
#[derive(Debug)]
pub enum CloseReason {
    /// Peer performed an orderly shutdown (zero-length read).
    PeerClosed,
    /// Outbound connect did not complete.
    ConnectFailed(io::Error),
    /// Read or write failed.
    Io(io::Error),
    /// A `Close` change was submitted for the connection.
    Requested,
    /// The reactor is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Whether the close indicates a failure rather than a normal end.
    pub fn is_error(&self) -> bool {
        matches!(self, CloseReason::ConnectFailed(_) | CloseReason::Io(_))
    }
}

/// Per-role protocol logic driven by the reactor thread.
pub trait Protocol {
    /// Per-connection protocol state, owned by the connection.
    type Session: Send + 'static;

    /// Size of every inbound frame on this protocol.
    fn frame_len(&self) -> usize;

    /// A connection was accepted on the listener.
    ///
    /// Returning `None` rejects the connection. Roles that never listen
    /// keep the default.
    fn on_accept(&mut self, _handle: ConnHandle, _peer: SocketAddr) -> Option<Self::Session> {
        None
    }

    /// An outbound connection finished connecting.
    fn on_connect(&mut self, _handle: ConnHandle, _session: &mut Self::Session) {}

    /// One complete inbound frame arrived.
    fn on_frame(&mut self, handle: ConnHandle, session: &mut Self::Session, frame: Bytes);

    /// The connection was closed and its session is released.
    fn on_close(&mut self, _handle: ConnHandle, _session: Self::Session, _reason: CloseReason) {}
}
