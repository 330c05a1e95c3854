//! Bus address parsing
//!
//! A bus address is given as a single string, either `"host:port"`, a bare
//! `"port"` (loopback implied), or a filesystem path to a local socket.
//! Processes usually receive it on the command line as `--bus-path=<value>`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Host used when only a port is given
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port used by the default configurations
pub const DEFAULT_PORT: u16 = 42_024;

/// Command-line flag carrying the bus address
pub const BUS_PATH_ARG: &str = "--bus-path";

/// Where the broker listens and clients connect
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusAddress {
    /// TCP endpoint
    Tcp {
        /// Host name or IP literal
        host: String,
        /// TCP port (0 lets the OS pick when binding)
        port: u16,
    },
    /// Local socket path (unix domain socket)
    Local(PathBuf),
}

impl BusAddress {
    /// TCP address
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Loopback TCP address on the given port
    pub fn port(port: u16) -> Self {
        Self::tcp(DEFAULT_HOST, port)
    }

    /// Local socket address
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local(path.into())
    }

    /// Parse `"host:port"`, `"port"` or a socket path
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidAddress(input.to_string()));
        }

        if trimmed.contains('/') || trimmed.contains('\\') {
            return Ok(Self::local(trimmed));
        }

        let (host, port) = match trimmed.rsplit_once(':') {
            Some((host, port)) => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let host = if host.is_empty() { DEFAULT_HOST } else { host };
                (host, port)
            }
            None => (DEFAULT_HOST, trimmed),
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidAddress(input.to_string()))?;

        Ok(Self::tcp(host, port))
    }

    /// Look for `--bus-path=<value>` in an argument list
    ///
    /// Returns `Ok(None)` when the flag is absent.
    pub fn from_args<I, S>(args: I) -> Result<Option<Self>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            let arg = arg.as_ref();
            if let Some(rest) = arg.strip_prefix(BUS_PATH_ARG) {
                if let Some(value) = rest.strip_prefix('=') {
                    return Self::parse(value).map(Some);
                }
            }
        }
        Ok(None)
    }

    /// [`BusAddress::from_args`] over this process's arguments
    pub fn from_cmdline() -> Result<Option<Self>> {
        Self::from_args(std::env::args())
    }

    /// Whether this is a local socket path
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl Default for BusAddress {
    fn default() -> Self {
        Self::port(DEFAULT_PORT)
    }
}

impl FromStr for BusAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}
