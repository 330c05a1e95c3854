//! Broker listener
//!
//! Binds the bus address, runs the accept loop and spawns one
//! [`Connection`] task per client.

use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::address::BusAddress;
use crate::error::{Error, Result};
use crate::protocol::StateRow;
use crate::registry::SubscriptionTable;
use crate::server::config::BrokerConfig;
use crate::server::connection::Connection;
use crate::server::dispatch::Dispatcher;
use crate::stats::BrokerStatsSnapshot;

/// Result of a successful [`IpcBusBroker::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    /// The broker is now listening
    Started,
    /// The broker was already listening; nothing changed
    AlreadyStarted,
}

impl fmt::Display for StartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Both report "started": a re-entrant start is not a failure
        f.write_str("started")
    }
}

struct Running {
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    #[cfg(unix)]
    socket_path: Option<PathBuf>,
    accept_task: JoinHandle<()>,
    cleanup_task: JoinHandle<()>,
}

/// The IPC bus broker
///
/// Owns the routing tables and, while started, the listening socket.
pub struct IpcBusBroker {
    config: BrokerConfig,
    dispatcher: Arc<Dispatcher>,
    connection_semaphore: Option<Arc<Semaphore>>,
    running: Mutex<Option<Running>>,
}

impl IpcBusBroker {
    /// Create a broker; nothing is bound until [`start`](Self::start)
    pub fn new(config: BrokerConfig) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            dispatcher: Arc::new(Dispatcher::new(config.peer_name.clone())),
            config,
            connection_semaphore,
            running: Mutex::new(None),
        }
    }

    /// Broker configuration
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Start listening
    ///
    /// `timeout` bounds how long binding may take; `None` or zero uses
    /// [`BrokerConfig::start_timeout`]. Calling this while already running
    /// returns [`StartStatus::AlreadyStarted`].
    pub async fn start(&self, timeout: Option<Duration>) -> Result<StartStatus> {
        if self.is_running() {
            return Ok(StartStatus::AlreadyStarted);
        }

        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.config.start_timeout);

        let bind = BusListener::bind(&self.config.address);
        let listener = match tokio::time::timeout(timeout, bind).await {
            Ok(bound) => bound?,
            Err(_) => {
                tracing::error!(
                    address = %self.config.address,
                    ?timeout,
                    "Broker did not start listening in time"
                );
                return Err(Error::ListenTimeout(timeout));
            }
        };

        let mut running = self.running.lock();
        if running.is_some() {
            // Lost a race with a concurrent start; our listener is dropped
            return Ok(StartStatus::AlreadyStarted);
        }

        let local_addr = listener.local_addr();
        #[cfg(unix)]
        let socket_path = listener.socket_path();

        tracing::info!(
            address = %self.config.address,
            local_addr = ?local_addr,
            peer = %self.config.peer_name,
            "IPC bus broker listening"
        );

        let shutdown = CancellationToken::new();
        let acceptor = Acceptor {
            config: self.config.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            connection_semaphore: self.connection_semaphore.clone(),
            shutdown: shutdown.clone(),
        };
        let accept_task = tokio::spawn(acceptor.run(listener));
        let cleanup_task = self.spawn_cleanup_task(shutdown.clone());

        *running = Some(Running {
            shutdown,
            local_addr,
            #[cfg(unix)]
            socket_path,
            accept_task,
            cleanup_task,
        });

        Ok(StartStatus::Started)
    }

    fn spawn_cleanup_task(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let pending = Arc::clone(self.dispatcher.pending());
        let interval = self.config.cleanup_interval;
        let ttl = self.config.pending_request_ttl;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = pending.purge_older_than(ttl);
                        if purged > 0 {
                            tracing::debug!(purged, "Purged stale pending requests");
                        }
                    }
                }
            }
        })
    }

    /// Stop listening and close every connection
    ///
    /// Safe to call any number of times.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.shutdown.cancel();
        running.cleanup_task.abort();
        running.accept_task.abort();
        // Wait for the listener to actually be dropped
        let _ = running.accept_task.await;

        #[cfg(unix)]
        remove_socket_file(running.socket_path.as_deref());

        tracing::info!(address = %self.config.address, "IPC bus broker stopped");
    }

    /// Whether the broker is listening
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bound TCP address, if listening on TCP
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().and_then(|r| r.local_addr)
    }

    /// Address clients should connect to
    ///
    /// Differs from the configured address when port 0 was requested.
    pub fn bus_address(&self) -> BusAddress {
        match self.local_addr() {
            Some(addr) => BusAddress::tcp(addr.ip().to_string(), addr.port()),
            None => self.config.address.clone(),
        }
    }

    /// Snapshot of every subscription
    pub fn query_state(&self) -> Vec<StateRow> {
        self.dispatcher.query_state()
    }

    /// Broker counters
    pub fn stats(&self) -> BrokerStatsSnapshot {
        self.dispatcher.stats().snapshot()
    }

    /// The live subscription table
    pub fn subscriptions(&self) -> &Arc<SubscriptionTable> {
        self.dispatcher.subscriptions()
    }

    /// Number of outstanding requests
    pub fn pending_requests(&self) -> usize {
        self.dispatcher.pending().len()
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.dispatcher.connections().len()
    }
}

impl Drop for IpcBusBroker {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.cancel();
            running.cleanup_task.abort();
            running.accept_task.abort();
            #[cfg(unix)]
            remove_socket_file(running.socket_path.as_deref());
        }
    }
}

#[cfg(unix)]
fn remove_socket_file(path: Option<&std::path::Path>) {
    if let Some(path) = path {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::debug!(path = %path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

enum BusListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

enum Accepted {
    Tcp(TcpStream, SocketAddr),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl BusListener {
    async fn bind(address: &BusAddress) -> Result<Self> {
        match address {
            BusAddress::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            BusAddress::Local(path) => {
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(Self::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            BusAddress::Local(path) => Err(crate::error::ProtocolError::UnsupportedAddress(
                path.display().to_string(),
            )
            .into()),
        }
    }

    async fn accept(&self) -> std::io::Result<Accepted> {
        match self {
            Self::Tcp(listener) => {
                let (socket, peer_addr) = listener.accept().await?;
                Ok(Accepted::Tcp(socket, peer_addr))
            }
            #[cfg(unix)]
            Self::Unix { listener, .. } => {
                let (socket, _) = listener.accept().await?;
                Ok(Accepted::Unix(socket))
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Self::Unix { .. } => None,
        }
    }

    #[cfg(unix)]
    fn socket_path(&self) -> Option<PathBuf> {
        match self {
            Self::Tcp(_) => None,
            Self::Unix { path, .. } => Some(path.clone()),
        }
    }
}

/// State moved into the accept loop task
struct Acceptor {
    config: BrokerConfig,
    dispatcher: Arc<Dispatcher>,
    connection_semaphore: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl Acceptor {
    async fn run(self, listener: BusListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => self.handle_connection(accepted),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }
        tracing::debug!("Accept loop exiting");
    }

    fn handle_connection(&self, accepted: Accepted) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(
                        limit = self.config.max_connections,
                        "Connection rejected: limit reached"
                    );
                    return;
                }
            }
        } else {
            None
        };

        match accepted {
            Accepted::Tcp(socket, peer_addr) => {
                if self.config.tcp_nodelay {
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::error!(error = %e, "Failed to configure socket");
                        return;
                    }
                }
                self.spawn(socket, peer_addr.to_string(), permit);
            }
            #[cfg(unix)]
            Accepted::Unix(socket) => {
                self.spawn(socket, self.config.address.to_string(), permit);
            }
        }
    }

    fn spawn<S>(&self, stream: S, peer_addr: String, permit: Option<OwnedSemaphorePermit>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.dispatcher.connections().allocate_id();
        tracing::debug!(connection = %id, peer = %peer_addr, "New connection");

        let connection = Connection::new(
            id,
            stream,
            peer_addr,
            Arc::clone(&self.dispatcher),
            self.shutdown.child_token(),
            self.config.max_frame_length,
        );

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = connection.run().await {
                tracing::debug!(connection = %id, error = %e, "Connection error");
            }
            tracing::debug!(connection = %id, "Connection closed");
        });
    }
}
