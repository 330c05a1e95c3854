//! Client configuration

use std::time::Duration;

use crate::address::BusAddress;
use crate::error::Result;

/// Default time allowed to reach the broker
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default request timeout, also used when a request asks for zero
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker address
    pub address: BusAddress,

    /// Name this client uses as sender on everything it publishes
    pub peer_name: String,

    /// How long `connect` may take
    pub connect_timeout: Duration,

    /// Request timeout used when none (or zero) is given
    pub request_timeout: Duration,

    /// Largest accepted frame body
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: BusAddress::default(),
            peer_name: format!("Node_{}", std::process::id()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_frame_length: 8 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Create a config for the broker at `address`
    pub fn new(address: BusAddress) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// Create a config from `--bus-path=<address>` on the command line
    ///
    /// Falls back to the default address when the flag is absent.
    pub fn from_cmdline() -> Result<Self> {
        Ok(Self::new(BusAddress::from_cmdline()?.unwrap_or_default()))
    }

    /// Set the peer name
    pub fn peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = name.into();
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.request_timeout = timeout;
        }
        self
    }

    /// Set the maximum frame length
    pub fn max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max.max(1);
        self
    }

    /// Effective timeout for a request asking for `requested`
    pub(crate) fn effective_request_timeout(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.request_timeout
        } else {
            requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();

        assert_eq!(config.address, BusAddress::default());
        assert_eq!(config.peer_name, format!("Node_{}", std::process::id()));
        assert_eq!(config.connect_timeout, Duration::from_millis(2000));
        assert_eq!(config.request_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn test_zero_request_timeout_falls_back() {
        let config = ClientConfig::default()
            .request_timeout(Duration::ZERO)
            .request_timeout(Duration::from_millis(300));

        assert_eq!(config.request_timeout, Duration::from_millis(300));
        assert_eq!(
            config.effective_request_timeout(Duration::ZERO),
            Duration::from_millis(300)
        );
        assert_eq!(
            config.effective_request_timeout(Duration::from_millis(50)),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_builder_chaining() {
        let config = ClientConfig::new(BusAddress::port(5000))
            .peer_name("Renderer_1")
            .connect_timeout(Duration::from_secs(1));

        assert_eq!(config.address, BusAddress::port(5000));
        assert_eq!(config.peer_name, "Renderer_1");
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
    }
}
