//! Broker configuration

use std::time::Duration;

use crate::address::BusAddress;

/// Default time allowed for the listener to come up
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_millis(2000);

/// Broker configuration options
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to listen on
    pub address: BusAddress,

    /// Identity used as sender on replies the broker answers itself
    pub peer_name: String,

    /// How long `start` waits for the listener when no timeout is given
    pub start_timeout: Duration,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Largest accepted frame body
    pub max_frame_length: usize,

    /// Pending requests older than this are dropped by the cleanup task
    pub pending_request_ttl: Duration,

    /// How often the cleanup task runs
    pub cleanup_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: BusAddress::default(),
            peer_name: format!("Broker_{}", std::process::id()),
            start_timeout: DEFAULT_START_TIMEOUT,
            max_connections: 0, // Unlimited
            tcp_nodelay: true,  // Small frames, latency matters
            max_frame_length: 8 * 1024 * 1024,
            pending_request_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    /// Create a new config listening on `address`
    pub fn with_address(address: BusAddress) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// Set the listen address
    pub fn address(mut self, address: BusAddress) -> Self {
        self.address = address;
        self
    }

    /// Set the broker peer name
    pub fn peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = name.into();
        self
    }

    /// Set the default start timeout
    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set the maximum frame length
    pub fn max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max.max(1);
        self
    }

    /// Set how long an unanswered request is kept
    pub fn pending_request_ttl(mut self, ttl: Duration) -> Self {
        self.pending_request_ttl = ttl;
        self
    }

    /// Set the cleanup task interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval.max(Duration::from_millis(1));
        self
    }
}
