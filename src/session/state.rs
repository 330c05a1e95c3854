//! Connection session state machine
//!
//! Tracks one broker connection from accept to teardown.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::registry::ConnectionId;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Accepted, reader and writer not yet running
    Connecting,
    /// Waiting for the next frame
    Idle,
    /// Dispatching a command
    Dispatching,
    /// Torn down
    Closed,
}

/// Complete session state
#[derive(Debug)]
pub struct SessionState {
    /// Broker-assigned connection id
    pub id: ConnectionId,

    /// Remote address, or socket path for local transports
    pub peer_addr: String,

    /// Current phase
    pub phase: SessionPhase,

    /// Connection start time
    pub connected_at: Instant,

    /// Frames decoded from the peer
    pub frames_received: u64,

    /// Frames that decoded to an unknown command
    pub frames_ignored: u64,

    /// Peer names seen on this connection
    peers: HashSet<String>,
}

impl SessionState {
    /// Create a new session state
    pub fn new(id: ConnectionId, peer_addr: impl Into<String>) -> Self {
        Self {
            id,
            peer_addr: peer_addr.into(),
            phase: SessionPhase::Connecting,
            connected_at: Instant::now(),
            frames_received: 0,
            frames_ignored: 0,
            peers: HashSet::new(),
        }
    }

    /// Reader and writer are running
    pub fn on_ready(&mut self) {
        if self.phase == SessionPhase::Connecting {
            self.phase = SessionPhase::Idle;
        }
    }

    /// A frame arrived and is about to be dispatched
    pub fn begin_dispatch(&mut self, peer_name: Option<&str>) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        self.frames_received += 1;
        self.phase = SessionPhase::Dispatching;

        if let Some(peer) = peer_name {
            if !self.peers.contains(peer) {
                tracing::debug!(connection = %self.id, peer, "New peer on connection");
                self.peers.insert(peer.to_string());
            }
        }
    }

    /// Dispatch finished
    pub fn end_dispatch(&mut self) {
        if self.phase == SessionPhase::Dispatching {
            self.phase = SessionPhase::Idle;
        }
    }

    /// The last dispatched frame was not understood
    pub fn on_ignored(&mut self) {
        self.frames_ignored += 1;
    }

    /// Peer names seen on this connection
    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.peers.iter().map(String::as_str)
    }

    /// Mark the session closed
    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    /// Whether the session still accepts frames
    pub fn is_open(&self) -> bool {
        self.phase != SessionPhase::Closed
    }

    /// Get session duration
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
