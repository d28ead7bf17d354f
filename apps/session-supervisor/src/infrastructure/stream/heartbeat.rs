//! Connection Liveness
//!
//! The server sends a 1-byte heartbeat frame every second or so while idle,
//! and the client pings on a fixed interval. Any inbound traffic counts as
//! proof of life; silence past the timeout means the socket is dead.

use std::time::{Duration, Instant};

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between client pings.
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, timeout: Duration) -> Self {
        Self {
            ping_interval,
            timeout,
        }
    }
}

/// Liveness tracker owned by a single connection task.
#[derive(Debug)]
pub struct Heartbeat {
    timeout: Duration,
    last_seen: Instant,
}

impl Heartbeat {
    /// Start tracking from now.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seen: Instant::now(),
        }
    }

    /// Record inbound traffic.
    pub fn record(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Time since the last inbound traffic.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// Whether the connection has been silent for longer than the timeout.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.silence() > self.timeout
    }
}
