//! Throughput counters and the periodic reporter.
//!
//! Counters are bumped from the reactor, worker and producer threads and
//! read by a reporter thread that logs a summary every interval. Handled
//! message metadata reaches the reporter over a one-way channel.

use crate::pool::WorkerId;
use chrono::{DateTime, Local};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Metadata published by the worker pool for every hashed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    /// Name of the client the payload came from.
    pub client: String,
    /// Hash sent back to the client.
    pub hash: String,
    /// Worker that computed the hash.
    pub worker: WorkerId,
}

/// Server-side counters.
#[derive(Debug)]
pub struct ServerStats {
    clients_connected: AtomicU64,
    packets: AtomicU64,
    started: Instant,
    started_at: DateTime<Local>,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            clients_connected: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            started: Instant::now(),
            started_at: Local::now(),
        }
    }

    pub fn client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Total clients ever accepted.
    pub fn clients_connected(&self) -> u64 {
        self.clients_connected.load(Ordering::Relaxed)
    }

    /// Total payloads read.
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Average payloads per second since start, zero before the first second.
    pub fn packets_per_second(&self) -> u64 {
        per_second(self.packets(), self.uptime())
    }
}

/// Client-side counters.
#[derive(Debug)]
pub struct ClientStats {
    sent: AtomicU64,
    matched: AtomicU64,
    mismatched: AtomicU64,
    lost: AtomicU64,
    started: Instant,
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStats {
    pub fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            mismatched: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn message_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hash_matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hash_mismatched(&self) {
        self.mismatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    pub fn mismatched(&self) -> u64 {
        self.mismatched.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn messages_per_second(&self) -> u64 {
        per_second(self.sent(), self.uptime())
    }
}

fn per_second(count: u64, elapsed: Duration) -> u64 {
    match elapsed.as_secs() {
        0 => 0,
        secs => count / secs,
    }
}

/// Format an uptime as `H:MM`.
pub fn format_uptime(uptime: Duration) -> String {
    let uptime = chrono::Duration::from_std(uptime).unwrap_or_else(|_| chrono::Duration::zero());
    format!("{}:{:02}", uptime.num_hours(), uptime.num_minutes() % 60)
}

/// Background thread invoking a report callback at a fixed interval.
pub struct Reporter {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Reporter {
    /// Spawn a reporter calling `report` every `interval`.
    ///
    /// The first report happens one interval after start.
    pub fn spawn<F>(name: &str, interval: Duration, mut report: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));

        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new().name(name.to_string()).spawn(move || {
                let (lock, cvar) = &*stop;
                let mut stopped = match lock.lock() {
                    Ok(stopped) => stopped,
                    Err(poisoned) => poisoned.into_inner(),
                };
                loop {
                    let deadline = Instant::now() + interval;
                    while !*stopped {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        stopped = match cvar.wait_timeout(stopped, remaining) {
                            Ok((stopped, _)) => stopped,
                            Err(poisoned) => poisoned.into_inner().0,
                        };
                    }
                    if *stopped {
                        break;
                    }

                    drop(stopped);
                    report();
                    stopped = match lock.lock() {
                        Ok(stopped) => stopped,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                debug!("Reporter stopped");
            })?
        };

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the reporter and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let (lock, cvar) = &*self.stop;
        match lock.lock() {
            Ok(mut stopped) => *stopped = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0:00");
        assert_eq!(format_uptime(Duration::from_secs(59)), "0:00");
        assert_eq!(format_uptime(Duration::from_secs(9 * 60)), "0:09");
        assert_eq!(format_uptime(Duration::from_secs(3600 + 61 * 60)), "2:01");
    }

    #[test]
    fn test_server_counters() {
        let stats = ServerStats::new();
        stats.client_connected();
        stats.packet_received();
        stats.packet_received();

        assert_eq!(stats.clients_connected(), 1);
        assert_eq!(stats.packets(), 2);
        // Less than a second has elapsed
        assert_eq!(stats.packets_per_second(), 0);
        assert_eq!(per_second(10, Duration::from_secs(4)), 2);
    }

    #[test]
    fn test_client_counters() {
        let stats = ClientStats::new();
        stats.message_sent();
        stats.message_sent();
        stats.hash_matched();
        stats.hash_mismatched();
        stats.response_lost();

        assert_eq!(stats.sent(), 2);
        assert_eq!(stats.matched(), 1);
        assert_eq!(stats.mismatched(), 1);
        assert_eq!(stats.lost(), 1);
    }

    #[test]
    fn test_reporter_runs_periodically_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let reporter = {
            let count = Arc::clone(&count);
            Reporter::spawn("test-stats", Duration::from_millis(10), move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        thread::sleep(Duration::from_millis(100));
        reporter.stop();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "reporter ran {seen} times");

        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
