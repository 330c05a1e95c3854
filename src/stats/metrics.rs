//! Statistics and metrics for the broker

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live broker counters
///
/// Updated lock-free from every connection task.
#[derive(Debug)]
pub struct BrokerStats {
    started_at: Instant,
    connections_accepted: AtomicU64,
    connections_active: AtomicU64,
    messages_routed: AtomicU64,
    deliveries: AtomicU64,
    requests_registered: AtomicU64,
    replies_routed: AtomicU64,
    replies_dropped: AtomicU64,
    frames_ignored: AtomicU64,
}

impl BrokerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            messages_routed: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            requests_registered: AtomicU64::new(0),
            replies_routed: AtomicU64::new(0),
            replies_dropped: AtomicU64::new(0),
            frames_ignored: AtomicU64::new(0),
        }
    }

    pub fn on_connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// A message or request was fanned out to `deliveries` connections
    pub fn on_message_routed(&self, deliveries: usize) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(deliveries as u64, Ordering::Relaxed);
    }

    pub fn on_request_registered(&self) {
        self.requests_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_reply_routed(&self) {
        self.replies_routed.fetch_add(1, Ordering::Relaxed);
    }

    /// A reply arrived for an unknown, answered or cancelled request
    pub fn on_reply_dropped(&self) {
        self.replies_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_frame_ignored(&self) {
        self.frames_ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counters
    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            requests_registered: self.requests_registered.load(Ordering::Relaxed),
            replies_routed: self.replies_routed.load(Ordering::Relaxed),
            replies_dropped: self.replies_dropped.load(Ordering::Relaxed),
            frames_ignored: self.frames_ignored.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Default for BrokerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`BrokerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStatsSnapshot {
    /// Total connections ever
    pub connections_accepted: u64,
    /// Current active connections
    pub connections_active: u64,
    /// Messages and requests fanned out
    pub messages_routed: u64,
    /// Individual events queued to subscribers
    pub deliveries: u64,
    /// Requests whose reply channel was registered
    pub requests_registered: u64,
    /// Replies delivered to their requester
    pub replies_routed: u64,
    /// Replies with no pending request
    pub replies_dropped: u64,
    /// Frames with an unknown command
    pub frames_ignored: u64,
    /// Uptime
    pub uptime: Duration,
}

impl BrokerStatsSnapshot {
    /// Average deliveries per routed message
    pub fn fan_out_ratio(&self) -> f64 {
        if self.messages_routed > 0 {
            self.deliveries as f64 / self.messages_routed as f64
        } else {
            0.0
        }
    }
}
