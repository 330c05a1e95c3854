//! Command dispatcher
//!
//! Applies one decoded [`BusCommand`] to the routing tables and queues the
//! resulting events on the affected connections. Dispatch never awaits:
//! every outbound write goes through a connection's own queue.

use std::sync::Arc;

use serde_json::Value;

use crate::protocol::{BusCommand, BusEvent, BusSender, StateRow};
use crate::registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, PendingRequests, SubscriptionTable,
};
use crate::stats::BrokerStats;

/// What the dispatcher did with a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The command was applied
    Handled,
    /// The command was not understood and has been dropped
    Ignored,
}

/// Shared routing state plus the logic that mutates it
pub struct Dispatcher {
    subscriptions: Arc<SubscriptionTable>,
    pending: Arc<PendingRequests>,
    connections: Arc<ConnectionRegistry>,
    stats: Arc<BrokerStats>,
    peer_name: String,
}

impl Dispatcher {
    /// Create a dispatcher with empty tables
    pub fn new(peer_name: impl Into<String>) -> Self {
        Self {
            subscriptions: Arc::new(SubscriptionTable::new()),
            pending: Arc::new(PendingRequests::new()),
            connections: Arc::new(ConnectionRegistry::new()),
            stats: Arc::new(BrokerStats::new()),
            peer_name: peer_name.into(),
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionTable> {
        &self.subscriptions
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn stats(&self) -> &Arc<BrokerStats> {
        &self.stats
    }

    /// Apply `command`, received on `origin`
    pub fn dispatch(&self, origin: &ConnectionHandle, command: BusCommand) -> DispatchOutcome {
        tracing::trace!(
            connection = %origin.id(),
            command = command.name(),
            channel = command.channel().unwrap_or(""),
            "Dispatching"
        );

        match command {
            BusCommand::SubscribeChannel { channel, peer_name } => {
                let outcome = self.subscriptions.add_ref(&channel, origin, &peer_name);
                if outcome.first_for_channel {
                    tracing::debug!(channel = %channel, "Channel created");
                }
            }

            BusCommand::UnsubscribeChannel {
                channel,
                peer_name,
                unsubscribe_all,
            } => {
                let outcome = if unsubscribe_all {
                    self.subscriptions
                        .release_all(&channel, origin.id(), &peer_name)
                } else {
                    self.subscriptions.release(&channel, origin.id(), &peer_name)
                };
                if outcome.is_some_and(|o| o.channel_removed) {
                    tracing::debug!(channel = %channel, "Channel removed");
                }
            }

            BusCommand::SendMessage {
                channel,
                peer_name,
                args,
            } => {
                let sender = BusSender::new(peer_name);
                self.fan_out(&channel, || BusEvent::SendMessage {
                    channel: channel.clone(),
                    sender: sender.clone(),
                    args: args.clone(),
                });
            }

            BusCommand::RequestMessage {
                channel,
                peer_name,
                reply_channel,
                args,
            } => {
                // Register before fan-out so a fast responder cannot race us
                self.pending.register(&reply_channel, origin);
                self.stats.on_request_registered();

                let sender = BusSender::new(peer_name);
                self.fan_out(&channel, || BusEvent::RequestMessage {
                    channel: channel.clone(),
                    sender: sender.clone(),
                    reply_channel: reply_channel.clone(),
                    args: args.clone(),
                });
            }

            BusCommand::RequestResponse {
                reply_channel,
                peer_name,
                resolve,
                payload,
            } => {
                self.route_reply(reply_channel, BusSender::new(peer_name), resolve, payload);
            }

            BusCommand::RequestCancel { reply_channel } => {
                let removed = self.pending.cancel(&reply_channel);
                tracing::debug!(reply_channel = %reply_channel, removed, "Request cancelled");
            }

            BusCommand::QueryState { reply_channel } => {
                self.answer_query_state(origin, reply_channel);
            }

            BusCommand::Unknown => {
                tracing::debug!(connection = %origin.id(), "Ignoring unknown command");
                self.stats.on_frame_ignored();
                return DispatchOutcome::Ignored;
            }
        }

        DispatchOutcome::Handled
    }

    /// Queue one event per connection subscribed to `channel`
    ///
    /// Works on a snapshot; connections torn down since the snapshot are
    /// skipped. Returns the number of connections reached.
    fn fan_out<F>(&self, channel: &str, mut build: F) -> usize
    where
        F: FnMut() -> BusEvent,
    {
        let mut delivered = 0;
        self.subscriptions.for_each_channel(channel, |subscriber| {
            let handle = &subscriber.handle;
            if handle.is_closed() {
                tracing::trace!(channel, connection = %handle.id(), "Skipping closed connection");
                return;
            }
            if handle.send(build()) {
                delivered += 1;
            }
        });

        self.stats.on_message_routed(delivered);
        tracing::debug!(channel, delivered, "Fan-out");
        delivered
    }

    fn route_reply(&self, reply_channel: String, sender: BusSender, resolve: bool, payload: Value) {
        let Some(requester) = self.pending.resolve(&reply_channel) else {
            tracing::debug!(reply_channel = %reply_channel, "Dropping reply with no pending request");
            self.stats.on_reply_dropped();
            return;
        };

        let requester_id = requester.id();
        let delivered = requester.send(BusEvent::RequestResponse {
            reply_channel: reply_channel.clone(),
            sender,
            resolve,
            payload,
        });

        if delivered {
            self.stats.on_reply_routed();
        } else {
            self.stats.on_reply_dropped();
        }
        tracing::debug!(
            reply_channel = %reply_channel,
            connection = %requester_id,
            resolve,
            delivered,
            "Reply routed"
        );
    }

    fn answer_query_state(&self, origin: &ConnectionHandle, reply_channel: String) {
        let rows = self.query_state();
        let (resolve, payload) = match serde_json::to_value(&rows) {
            Ok(payload) => (true, payload),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode state rows");
                (false, Value::String(e.to_string()))
            }
        };

        tracing::debug!(
            connection = %origin.id(),
            rows = rows.len(),
            "Answering queryState"
        );

        origin.send(BusEvent::RequestResponse {
            reply_channel,
            sender: BusSender::new(self.peer_name.clone()),
            resolve,
            payload,
        });
    }

    /// Snapshot of every subscription as state rows
    pub fn query_state(&self) -> Vec<StateRow> {
        self.subscriptions
            .rows()
            .into_iter()
            .map(StateRow::from)
            .collect()
    }

    /// Release everything a torn-down connection held
    pub fn release_connection(&self, id: ConnectionId) {
        let channels = self.subscriptions.release_connection(id);
        let requests = self.pending.release_connection(id);
        self.connections.remove(id);

        tracing::debug!(
            connection = %id,
            channels = channels.len(),
            pending_requests = requests,
            "Connection released"
        );
    }
}
