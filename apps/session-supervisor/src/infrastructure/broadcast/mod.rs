//! Tick Broadcast
//!
//! Fans ticks out to any number of in-process subscribers over a tokio
//! broadcast channel. Slow receivers lag and lose the oldest ticks; the
//! stream itself is never back-pressured.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::application::ports::{Tick, TickConsumer};

/// Default channel capacity.
pub const DEFAULT_TICK_CAPACITY: usize = 10_000;

/// Broadcast statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    /// Ticks delivered to at least one receiver.
    pub sent: u64,
    /// Ticks published with no receiver attached.
    pub dropped: u64,
    /// Currently attached receivers.
    pub receivers: usize,
}

/// Broadcast fan-out for ticks.
///
/// # Example
///
/// ```rust
/// use session_supervisor::infrastructure::broadcast::TickBroadcast;
///
/// let broadcast = TickBroadcast::new(1024);
/// let _rx = broadcast.subscribe();
/// assert_eq!(broadcast.stats().receivers, 1);
/// ```
#[derive(Debug)]
pub struct TickBroadcast {
    tx: broadcast::Sender<Tick>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Shared tick broadcast.
pub type SharedTickBroadcast = Arc<TickBroadcast>;

impl TickBroadcast {
    /// Create a broadcast with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Get a new receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Tick> {
        self.tx.subscribe()
    }

    /// Publish a tick. Returns the number of receivers reached.
    pub fn send(&self, tick: Tick) -> usize {
        if let Ok(count) = self.tx.send(tick) {
            self.sent.fetch_add(1, Ordering::Relaxed);
            count
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            0
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            receivers: self.tx.receiver_count(),
        }
    }
}

impl Default for TickBroadcast {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_CAPACITY)
    }
}

impl TickConsumer for TickBroadcast {
    fn on_tick(&self, tick: &Tick) {
        self.send(tick.clone());
    }
}

// =============================================================================
// Tests
// =============================================================================
