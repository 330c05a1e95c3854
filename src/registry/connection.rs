//! Connection registry
//!
//! Maps broker-assigned connection ids to the handle used to push events to
//! that connection's writer task.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::protocol::BusEvent;

/// Broker-assigned connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a live connection
///
/// Cheap to clone. Sending never blocks: events are queued for the
/// connection's dedicated writer task, so one slow peer cannot stall
/// fan-out to the others.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    label: Arc<str>,
    outbound: mpsc::UnboundedSender<BusEvent>,
}

impl ConnectionHandle {
    /// Create a handle around an existing outbound queue
    pub fn new(
        id: ConnectionId,
        label: impl Into<Arc<str>>,
        outbound: mpsc::UnboundedSender<BusEvent>,
    ) -> Self {
        Self {
            id,
            label: label.into(),
            outbound,
        }
    }

    /// Create a handle together with the receiving end of its queue
    pub fn channel(
        id: ConnectionId,
        label: impl Into<Arc<str>>,
    ) -> (Self, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id, label, tx), rx)
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Human-readable label (usually the remote address)
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue an event for delivery
    ///
    /// Returns `false` if the connection has already been torn down.
    pub fn send(&self, event: BusEvent) -> bool {
        self.outbound.send(event).is_ok()
    }

    /// Whether the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Registry of live connections
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry; the first allocated id is 1
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh connection id
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a live connection
    pub fn register(&self, handle: ConnectionHandle) {
        tracing::debug!(connection = %handle.id(), label = handle.label(), "Connection registered");
        self.connections.insert(handle.id(), handle);
    }

    /// Remove a connection
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
