//! Client transport façade
//!
//! Turns the application-facing API (`send`, `request`, `on`, `once`, ...)
//! into wire commands, and inbound events back into listener calls.
//!
//! Subscriptions are push-based: every listener added sends one
//! `subscribeChannel`, every listener removed sends one `unsubscribeChannel`.
//! Deduplication is the broker's job (it reference-counts per peer).

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::address::BusAddress;
use crate::error::{Error, RequestError, Result};
use crate::protocol::{generate_reply_channel, BusCommand, BusEvent, JsonCodec, StateRow};

use super::config::ClientConfig;
use super::event::{IpcBusEvent, RequestHandle, RequestResponse};
use super::listeners::{Listener, ListenerId, ListenerRegistry};

/// Channel name recorded for `queryState` round trips
const QUERY_STATE_CHANNEL: &str = "queryState";

struct PendingReply {
    channel: String,
    tx: oneshot::Sender<Result<RequestResponse>>,
}

/// Owns one pending reply entry for the lifetime of a request future
///
/// Dropping it while the entry is still registered (the caller gave up on
/// the future) removes the entry and cancels the request at the broker.
struct ReplyGuard<'a> {
    inner: &'a ClientInner,
    reply_channel: String,
}

impl ReplyGuard<'_> {
    /// Remove the entry and send `requestCancel`; false if a reply or
    /// disconnect already took it
    fn cancel(&self) -> bool {
        if self.inner.pending.lock().remove(&self.reply_channel).is_none() {
            return false;
        }
        let cancel = BusCommand::RequestCancel {
            reply_channel: self.reply_channel.clone(),
        };
        if self.inner.push(cancel).is_err() {
            tracing::trace!(reply_channel = %self.reply_channel, "Not connected, cancel not sent");
        }
        true
    }
}

impl Drop for ReplyGuard<'_> {
    fn drop(&mut self) {
        if self.cancel() {
            tracing::debug!(reply_channel = %self.reply_channel, "Request abandoned");
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    peer_name: Arc<str>,
    outbound: Mutex<Option<mpsc::UnboundedSender<BusCommand>>>,
    listeners: Mutex<ListenerRegistry>,
    pending: Mutex<HashMap<String, PendingReply>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Connection from one process to the bus
///
/// Cheap to clone; clones share the connection. The connection closes when
/// [`close`](Self::close) is called, the broker goes away, or the last clone
/// is dropped. A listener that captures a clone of its own client keeps the
/// connection alive until `close` is called.
///
/// # Example
/// ```no_run
/// use ipc_bus::client::{ClientConfig, IpcBusClient};
/// use ipc_bus::BusAddress;
/// use serde_json::json;
///
/// # async fn example() -> ipc_bus::error::Result<()> {
/// let client = IpcBusClient::connect(ClientConfig::new(BusAddress::port(42024))).await?;
///
/// client.on("news", |event, args| {
///     println!("{} from {}: {:?}", event.channel, event.sender.peer_name, args);
/// })?;
/// client.send("news", vec![json!("hello")])?;
///
/// let sum = client
///     .request("math/add", vec![json!(1), json!(2)], std::time::Duration::from_secs(1))
///     .await?;
/// println!("1 + 2 = {}", sum.payload);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct IpcBusClient {
    inner: Arc<ClientInner>,
}

impl IpcBusClient {
    /// Connect to the broker at `config.address`
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let timeout = config.connect_timeout;
        let address = config.address.clone();

        let connecting = async {
            match &address {
                BusAddress::Tcp { host, port } => {
                    let stream = TcpStream::connect((host.as_str(), *port)).await?;
                    stream.set_nodelay(true)?;
                    Ok::<_, Error>(Self::with_stream(config, stream))
                }
                #[cfg(unix)]
                BusAddress::Local(path) => {
                    let stream = tokio::net::UnixStream::connect(path).await?;
                    Ok(Self::with_stream(config, stream))
                }
                #[cfg(not(unix))]
                BusAddress::Local(path) => Err(crate::error::ProtocolError::UnsupportedAddress(
                    path.display().to_string(),
                )
                .into()),
            }
        };

        match tokio::time::timeout(timeout, connecting).await {
            Ok(result) => {
                if let Ok(client) = &result {
                    tracing::info!(
                        address = %address,
                        peer = client.peer_name(),
                        "Connected to broker"
                    );
                }
                result
            }
            Err(_) => Err(Error::ConnectTimeout(timeout)),
        }
    }

    /// Run the client over an already-connected stream
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_stream<S>(config: ClientConfig, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(
            read_half,
            JsonCodec::<BusEvent>::with_max_frame_length(config.max_frame_length),
        );
        let writer = FramedWrite::new(
            write_half,
            JsonCodec::<BusCommand>::with_max_frame_length(config.max_frame_length),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(ClientInner {
            peer_name: Arc::from(config.peer_name.as_str()),
            config,
            outbound: Mutex::new(Some(tx)),
            listeners: Mutex::new(ListenerRegistry::new()),
            pending: Mutex::new(HashMap::new()),
            writer_task: Mutex::new(None),
            shutdown: shutdown.clone(),
        });

        let writer_task = tokio::spawn(write_loop(writer, rx, shutdown.clone()));
        *inner.writer_task.lock() = Some(writer_task);
        tokio::spawn(read_loop(reader, Arc::downgrade(&inner), shutdown));

        Self { inner }
    }

    /// Name this client publishes as
    pub fn peer_name(&self) -> &str {
        &self.inner.peer_name
    }

    /// Whether the broker connection is still up
    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().is_some()
    }

    /// Publish `args` on `channel`
    pub fn send(&self, channel: &str, args: Vec<Value>) -> Result<()> {
        self.inner.push(BusCommand::SendMessage {
            channel: channel.to_string(),
            peer_name: self.inner.peer_name.to_string(),
            args,
        })
    }

    /// Add a listener for `channel`
    pub fn on<F>(&self, channel: &str, listener: F) -> Result<ListenerId>
    where
        F: Fn(&IpcBusEvent, &[Value]) + Send + Sync + 'static,
    {
        self.inner.add_listener(channel, Arc::new(listener), false, false)
    }

    /// Alias of [`on`](Self::on)
    pub fn add_listener<F>(&self, channel: &str, listener: F) -> Result<ListenerId>
    where
        F: Fn(&IpcBusEvent, &[Value]) + Send + Sync + 'static,
    {
        self.on(channel, listener)
    }

    /// Add a listener removed after its first call
    pub fn once<F>(&self, channel: &str, listener: F) -> Result<ListenerId>
    where
        F: Fn(&IpcBusEvent, &[Value]) + Send + Sync + 'static,
    {
        self.inner.add_listener(channel, Arc::new(listener), true, false)
    }

    /// Add a listener ahead of the existing ones
    pub fn prepend_listener<F>(&self, channel: &str, listener: F) -> Result<ListenerId>
    where
        F: Fn(&IpcBusEvent, &[Value]) + Send + Sync + 'static,
    {
        self.inner.add_listener(channel, Arc::new(listener), false, true)
    }

    /// [`once`](Self::once), ahead of the existing listeners
    pub fn prepend_once_listener<F>(&self, channel: &str, listener: F) -> Result<ListenerId>
    where
        F: Fn(&IpcBusEvent, &[Value]) + Send + Sync + 'static,
    {
        self.inner.add_listener(channel, Arc::new(listener), true, true)
    }

    /// Remove one listener
    ///
    /// Returns `false` if it was not registered on `channel`, in which case
    /// nothing is sent to the broker.
    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        let removed = self.inner.listeners.lock().remove(channel, id);
        if removed {
            self.inner.push_unsubscribe(channel, false);
        }
        removed
    }

    /// Alias of [`remove_listener`](Self::remove_listener)
    pub fn off(&self, channel: &str, id: ListenerId) -> bool {
        self.remove_listener(channel, id)
    }

    /// Remove every listener on `channel` and drop all broker references
    pub fn remove_all_listeners(&self, channel: &str) -> usize {
        let removed = self.inner.listeners.lock().remove_all(channel);
        self.inner.push_unsubscribe(channel, true);
        removed
    }

    /// Number of local listeners on `channel`
    pub fn listener_count(&self, channel: &str) -> usize {
        self.inner.listeners.lock().count(channel)
    }

    /// Send a request on `channel` and wait for the single reply
    ///
    /// A zero `timeout` uses [`ClientConfig::request_timeout`]. On timeout a
    /// `requestCancel` is sent to the broker, as it is when the returned
    /// future is dropped before completing.
    pub async fn request(
        &self,
        channel: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<RequestResponse> {
        let timeout = self.inner.config.effective_request_timeout(timeout);
        let reply_channel = generate_reply_channel();

        let (guard, rx) = self.inner.register_reply(reply_channel.clone(), channel);
        self.inner.push(BusCommand::RequestMessage {
            channel: channel.to_string(),
            peer_name: self.inner.peer_name.to_string(),
            reply_channel: reply_channel.clone(),
            args,
        })?;

        tracing::debug!(channel, reply_channel = %reply_channel, ?timeout, "Request sent");
        self.inner.await_reply(channel, guard, rx, timeout).await
    }

    /// Ask the broker for every (channel, peer, count) subscription
    pub async fn query_state(&self, timeout: Duration) -> Result<Vec<StateRow>> {
        let timeout = self.inner.config.effective_request_timeout(timeout);
        let reply_channel = generate_reply_channel();

        let (guard, rx) = self
            .inner
            .register_reply(reply_channel.clone(), QUERY_STATE_CHANNEL);
        self.inner.push(BusCommand::QueryState { reply_channel })?;

        let response = self
            .inner
            .await_reply(QUERY_STATE_CHANNEL, guard, rx, timeout)
            .await?;
        response.payload_as()
    }

    /// Close the connection
    ///
    /// Commands already queued are flushed first. Pending requests fail with
    /// [`Error::ConnectionClosed`]; later calls return
    /// [`Error::NotConnected`]. Safe to call more than once.
    pub async fn close(&self) {
        self.inner.disconnect();
        let writer_task = self.inner.writer_task.lock().take();
        if let Some(task) = writer_task {
            let _ = task.await;
            tracing::debug!(peer = %self.inner.peer_name, "Client closed");
        }
    }
}

impl std::fmt::Debug for IpcBusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcBusClient")
            .field("peer_name", &self.inner.peer_name)
            .field("address", &self.inner.config.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ClientInner {
    fn push(&self, command: BusCommand) -> Result<()> {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(command).map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }

    fn push_unsubscribe(&self, channel: &str, all: bool) {
        let result = self.push(BusCommand::UnsubscribeChannel {
            channel: channel.to_string(),
            peer_name: self.peer_name.to_string(),
            unsubscribe_all: all,
        });
        if result.is_err() {
            tracing::trace!(channel, "Not connected, unsubscribe not sent");
        }
    }

    fn add_listener(
        &self,
        channel: &str,
        listener: Listener,
        once: bool,
        prepend: bool,
    ) -> Result<ListenerId> {
        if self.outbound.lock().is_none() {
            return Err(Error::NotConnected);
        }

        let id = self.listeners.lock().add(channel, listener, once, prepend);
        let subscribed = self.push(BusCommand::SubscribeChannel {
            channel: channel.to_string(),
            peer_name: self.peer_name.to_string(),
        });
        if let Err(e) = subscribed {
            self.listeners.lock().remove(channel, id);
            return Err(e);
        }

        tracing::debug!(channel, listener = %id, once, prepend, "Listener added");
        Ok(id)
    }

    fn register_reply(
        &self,
        reply_channel: String,
        channel: &str,
    ) -> (ReplyGuard<'_>, oneshot::Receiver<Result<RequestResponse>>) {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            reply_channel.clone(),
            PendingReply {
                channel: channel.to_string(),
                tx,
            },
        );
        let guard = ReplyGuard {
            inner: self,
            reply_channel,
        };
        (guard, rx)
    }

    async fn await_reply(
        &self,
        channel: &str,
        guard: ReplyGuard<'_>,
        mut rx: oneshot::Receiver<Result<RequestResponse>>,
        timeout: Duration,
    ) -> Result<RequestResponse> {
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                // Whoever removes the entry decides the outcome
                if guard.cancel() {
                    tracing::debug!(
                        channel,
                        reply_channel = %guard.reply_channel,
                        ?timeout,
                        "Request timed out"
                    );
                    return Err(RequestError::Timeout {
                        channel: channel.to_string(),
                        timeout,
                    }
                    .into());
                }

                // A reply or disconnect took the entry first; its sender is
                // about to complete
                rx.await.unwrap_or(Err(Error::ConnectionClosed))
            }
        }
    }

    fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::SendMessage {
                channel,
                sender,
                args,
            } => {
                let event = IpcBusEvent {
                    channel,
                    sender,
                    request: None,
                };
                self.emit(&event, &args);
            }

            BusEvent::RequestMessage {
                channel,
                sender,
                reply_channel,
                args,
            } => {
                let Some(outbound) = self.outbound.lock().clone() else {
                    return;
                };
                let event = IpcBusEvent {
                    channel,
                    sender,
                    request: Some(RequestHandle::new(
                        reply_channel,
                        Arc::clone(&self.peer_name),
                        outbound,
                    )),
                };
                self.emit(&event, &args);
            }

            BusEvent::RequestResponse {
                reply_channel,
                sender,
                resolve,
                payload,
            } => {
                let Some(pending) = self.pending.lock().remove(&reply_channel) else {
                    tracing::trace!(reply_channel = %reply_channel, "Late reply dropped");
                    return;
                };

                let event = IpcBusEvent {
                    channel: pending.channel,
                    sender,
                    request: None,
                };
                let result = if resolve {
                    Ok(RequestResponse { event, payload })
                } else {
                    Err(RequestError::Rejected {
                        event,
                        reason: rejection_reason(payload),
                    }
                    .into())
                };
                // Receiver gone means the caller stopped waiting
                let _ = pending.tx.send(result);
            }

            BusEvent::Unknown => {
                tracing::debug!("Ignoring unknown event");
            }
        }
    }

    fn emit(&self, event: &IpcBusEvent, args: &[Value]) {
        let emission = self.listeners.lock().take_for_emit(&event.channel);
        if emission.callbacks.is_empty() {
            tracing::trace!(channel = %event.channel, "No local listener");
            return;
        }

        // No lock held here, callbacks may call back into the client
        for callback in &emission.callbacks {
            callback(event, args);
        }

        for _ in 0..emission.once_fired {
            self.push_unsubscribe(&event.channel, false);
        }
    }

    fn disconnect(&self) {
        let was_connected = self.outbound.lock().take().is_some();
        self.shutdown.cancel();

        let pending: Vec<PendingReply> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for reply in pending {
            let _ = reply.tx.send(Err(Error::ConnectionClosed));
        }

        if was_connected {
            tracing::debug!(peer = %self.peer_name, "Disconnected from broker");
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn rejection_reason(payload: Value) -> String {
    match payload {
        Value::String(reason) => reason,
        Value::Null => "rejected".to_string(),
        other => other.to_string(),
    }
}

async fn read_loop<R>(
    mut reader: FramedRead<R, JsonCodec<BusEvent>>,
    inner: Weak<ClientInner>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(event)) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                tracing::trace!(event = event.name(), "Event received");
                inner.handle_event(event);
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Read error");
                break;
            }
            None => {
                tracing::debug!("Broker closed connection");
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.disconnect();
    }
}

async fn write_loop<W>(
    mut writer: FramedWrite<WriteHalf<W>, JsonCodec<BusCommand>>,
    mut outbound: mpsc::UnboundedReceiver<BusCommand>,
    shutdown: CancellationToken,
) where
    W: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let command = tokio::select! {
            biased;
            command = outbound.recv() => command,
            _ = shutdown.cancelled() => None,
        };

        let Some(command) = command else {
            break;
        };
        if let Err(e) = writer.send(command).await {
            tracing::debug!(error = %e, "Write failed");
            return;
        }
    }

    // Flush what was queued before shutdown
    while let Ok(command) = outbound.try_recv() {
        if writer.feed(command).await.is_err() {
            return;
        }
    }
    let _ = writer.flush().await;
    let _ = writer.close().await;
}
