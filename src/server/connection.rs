//! Per-connection task
//!
//! A reader loop decodes commands in order and hands them to the
//! [`Dispatcher`]. A separate writer task drains the connection's outbound
//! queue, so a slow peer only delays itself.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{BusCommand, BusEvent, JsonCodec};
use crate::registry::{ConnectionHandle, ConnectionId};
use crate::server::dispatch::{DispatchOutcome, Dispatcher};
use crate::session::SessionState;

/// Frames written before an explicit flush
const WRITE_BATCH: usize = 64;

/// One accepted broker connection
pub struct Connection<S> {
    stream: S,
    state: SessionState,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    max_frame_length: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: ConnectionId,
        stream: S,
        peer_addr: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
        max_frame_length: usize,
    ) -> Self {
        Self {
            stream,
            state: SessionState::new(id, peer_addr),
            dispatcher,
            shutdown,
            max_frame_length,
        }
    }

    /// Run until EOF, an I/O error or broker shutdown
    ///
    /// Everything the connection held is released before this returns, on
    /// every exit path.
    pub async fn run(self) -> Result<()> {
        let Self {
            stream,
            mut state,
            dispatcher,
            shutdown,
            max_frame_length,
        } = self;

        let id = state.id;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(
            read_half,
            JsonCodec::<BusCommand>::with_max_frame_length(max_frame_length),
        );
        let writer = FramedWrite::new(
            write_half,
            JsonCodec::<BusEvent>::with_max_frame_length(max_frame_length),
        );

        let (handle, outbound_rx) = ConnectionHandle::channel(id, state.peer_addr.clone());
        dispatcher.connections().register(handle.clone());
        dispatcher.stats().on_connection_opened();

        let writer_task = spawn_writer(id, writer, outbound_rx);
        state.on_ready();

        tracing::info!(connection = %id, peer = %state.peer_addr, "Client connected");

        let result = loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(connection = %id, "Shutdown requested");
                    break Ok(());
                }
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(command)) => {
                    state.begin_dispatch(peer_name_of(&command));
                    if dispatcher.dispatch(&handle, command) == DispatchOutcome::Ignored {
                        state.on_ignored();
                    }
                    state.end_dispatch();
                }
                Some(Err(e)) => {
                    tracing::debug!(connection = %id, error = %e, "Read error");
                    break Err(e.into());
                }
                None => {
                    tracing::debug!(connection = %id, "Peer closed connection");
                    break Ok(());
                }
            }
        };

        state.close();
        dispatcher.release_connection(id);
        dispatcher.stats().on_connection_closed();

        // Dropping the last handle closes the queue and lets the writer
        // flush what is already queued.
        drop(handle);
        if shutdown.is_cancelled() {
            writer_task.abort();
        }

        let peers: Vec<&str> = state.peers().collect();
        tracing::info!(
            connection = %id,
            peers = ?peers,
            frames = state.frames_received,
            ignored = state.frames_ignored,
            duration = ?state.duration(),
            "Client disconnected"
        );

        result
    }
}

fn peer_name_of(command: &BusCommand) -> Option<&str> {
    match command {
        BusCommand::SubscribeChannel { peer_name, .. }
        | BusCommand::UnsubscribeChannel { peer_name, .. }
        | BusCommand::SendMessage { peer_name, .. }
        | BusCommand::RequestMessage { peer_name, .. }
        | BusCommand::RequestResponse { peer_name, .. } => Some(peer_name),
        BusCommand::RequestCancel { .. } | BusCommand::QueryState { .. } | BusCommand::Unknown => {
            None
        }
    }
}

fn spawn_writer<W>(
    id: ConnectionId,
    mut writer: FramedWrite<WriteHalf<W>, JsonCodec<BusEvent>>,
    mut outbound: mpsc::UnboundedReceiver<BusEvent>,
) -> JoinHandle<()>
where
    W: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            if let Err(e) = writer.feed(event).await {
                tracing::debug!(connection = %id, error = %e, "Write failed");
                break;
            }

            // Batch whatever else is already queued into one flush
            let mut batched = 1;
            while batched < WRITE_BATCH {
                match outbound.try_recv() {
                    Ok(event) => {
                        if let Err(e) = writer.feed(event).await {
                            tracing::debug!(connection = %id, error = %e, "Write failed");
                            return;
                        }
                        batched += 1;
                    }
                    Err(_) => break,
                }
            }

            if let Err(e) = writer.flush().await {
                tracing::debug!(connection = %id, error = %e, "Flush failed");
                break;
            }
        }

        // Close our receiving end so handles still in snapshots see it
        outbound.close();
        tracing::trace!(connection = %id, "Writer task exiting");
    })
}
