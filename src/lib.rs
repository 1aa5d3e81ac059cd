//! hashload: a reactor-based throughput tester
//!
//! A server and a client exchanging fixed-size random payloads and their
//! SHA-1 hashes over persistent TCP connections:
//! - Client sends 8 KB payloads at a fixed rate per connection
//! - Server hashes each payload on a worker pool and answers in order
//! - Client verifies every answer against the hash it expected
//!
//! Both roles share one mio-based connection multiplexer. Other threads
//! reach it only through a queue of pending changes.

pub mod client;
pub mod config;
pub mod hash;
pub mod pool;
pub mod runtime;
pub mod server;
pub mod stats;
