//! Readiness-based connection multiplexer shared by client and server.
//!
//! Built on mio (epoll on Linux, kqueue on macOS). The pieces:
//! - `Reactor`: single-threaded event loop owning every connection
//! - `ReactorHandle`: thread-safe side door for queueing `PendingChange`s
//! - `Connection`: connection state machine with frame and write buffers
//! - `Protocol`: hooks through which the role-specific logic sees frames

mod buffer;
mod connection;
mod dispatch;
mod event_loop;
mod protocol;
mod token;

pub use buffer::{FlushStatus, FrameBuffer, WriteQueue};
pub use connection::{ConnState, Connection, ConnectionRegistry};
pub use dispatch::{ChangeKind, DispatchQueue, PendingChange};
pub use event_loop::{Reactor, ReactorHandle};
pub use protocol::{CloseReason, Protocol};
pub use token::ConnHandle;
