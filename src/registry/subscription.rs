//! Channel subscription table
//!
//! Nested map `channel -> connection -> peer name -> count`. Fan-out and
//! connection teardown only touch the subscribers of one key, never the whole
//! table.
//!
//! Each channel lives in its own dashmap slot, so mutations to one channel
//! are serialized while different channels proceed in parallel. A release
//! that empties a channel removes it with `remove_if`, which re-checks
//! emptiness under the slot lock; a concurrent `add_ref` either lands before
//! (and keeps the channel) or after (and recreates it).

use std::collections::HashMap;

use dashmap::DashMap;

use super::connection::{ConnectionHandle, ConnectionId};
use crate::protocol::StateRow;

/// Per-connection subscription data for one channel
#[derive(Debug)]
struct ConnectionEntry {
    handle: ConnectionHandle,
    peers: HashMap<String, u32>,
}

type ChannelEntry = HashMap<ConnectionId, ConnectionEntry>;

/// Result of [`SubscriptionTable::add_ref`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddRefOutcome {
    /// Count for (channel, connection, peer) after the increment
    pub count: u32,
    /// The peer went from 0 to 1 reference on this channel
    pub first_for_peer: bool,
    /// The connection was not subscribed to this channel before
    pub first_for_connection: bool,
    /// The channel did not exist before
    pub first_for_channel: bool,
}

/// Result of a successful release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Count left for (channel, connection, peer)
    pub remaining: u32,
    /// The peer dropped to 0 references on this channel
    pub last_for_peer: bool,
    /// The connection no longer subscribes to this channel
    pub last_for_connection: bool,
    /// The channel has no subscribers left and was removed
    pub channel_removed: bool,
}

/// Snapshot of one subscribed connection, used for fan-out
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    /// Handle used to deliver events
    pub handle: ConnectionHandle,
    /// Peers on this connection and their counts
    pub peers: Vec<(String, u32)>,
}

impl ChannelSubscriber {
    /// Connection id of this subscriber
    pub fn connection(&self) -> ConnectionId {
        self.handle.id()
    }

    /// Total references held by this connection
    pub fn total_count(&self) -> u32 {
        self.peers.iter().map(|(_, count)| *count).sum()
    }
}

/// One (channel, connection, peer, count) tuple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRow {
    pub channel: String,
    pub connection: ConnectionId,
    pub peer_name: String,
    pub count: u32,
}

impl From<SubscriptionRow> for StateRow {
    fn from(row: SubscriptionRow) -> Self {
        StateRow {
            channel: row.channel,
            peer_name: row.peer_name,
            count: row.count,
        }
    }
}

/// Reference-counted subscriptions
pub struct SubscriptionTable {
    channels: DashMap<String, ChannelEntry>,
}

impl SubscriptionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Add one reference for `peer_name` on `channel` through `handle`
    pub fn add_ref(
        &self,
        channel: &str,
        handle: &ConnectionHandle,
        peer_name: &str,
    ) -> AddRefOutcome {
        let id = handle.id();
        let mut first_for_channel = false;

        let mut subscribers = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                first_for_channel = true;
                ChannelEntry::new()
            });

        let first_for_connection = !subscribers.contains_key(&id);
        let entry = subscribers.entry(id).or_insert_with(|| ConnectionEntry {
            handle: handle.clone(),
            peers: HashMap::new(),
        });
        let counter = entry.peers.entry(peer_name.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        let count = *counter;
        drop(subscribers);

        tracing::debug!(channel, connection = %id, peer = peer_name, count, "AddRef");

        AddRefOutcome {
            count,
            first_for_peer: count == 1,
            first_for_connection,
            first_for_channel,
        }
    }

    /// Drop one reference
    ///
    /// Returns `None` (and logs a warning) if the channel, connection or
    /// peer is unknown.
    pub fn release(
        &self,
        channel: &str,
        connection: ConnectionId,
        peer_name: &str,
    ) -> Option<ReleaseOutcome> {
        self.release_peer(channel, connection, peer_name, false)
    }

    /// Drop every reference `peer_name` holds on `channel`
    pub fn release_all(
        &self,
        channel: &str,
        connection: ConnectionId,
        peer_name: &str,
    ) -> Option<ReleaseOutcome> {
        self.release_peer(channel, connection, peer_name, true)
    }

    fn release_peer(
        &self,
        channel: &str,
        connection: ConnectionId,
        peer_name: &str,
        all: bool,
    ) -> Option<ReleaseOutcome> {
        let (remaining, last_for_connection) = {
            let Some(mut subscribers) = self.channels.get_mut(channel) else {
                tracing::warn!(channel, "Release: unknown channel");
                return None;
            };
            let Some(entry) = subscribers.get_mut(&connection) else {
                tracing::warn!(channel, connection = %connection, "Release: unknown connection");
                return None;
            };
            let Some(counter) = entry.peers.get_mut(peer_name) else {
                tracing::warn!(channel, connection = %connection, peer = peer_name, "Release: unknown peer");
                return None;
            };

            let remaining = if all { 0 } else { counter.saturating_sub(1) };
            *counter = remaining;
            if remaining == 0 {
                entry.peers.remove(peer_name);
            }

            let last_for_connection = entry.peers.is_empty();
            if last_for_connection {
                subscribers.remove(&connection);
            }
            (remaining, last_for_connection)
        };

        let channel_removed = last_for_connection && self.remove_if_empty(channel);

        tracing::debug!(
            channel,
            connection = %connection,
            peer = peer_name,
            remaining,
            all,
            "Release"
        );

        Some(ReleaseOutcome {
            remaining,
            last_for_peer: remaining == 0,
            last_for_connection,
            channel_removed,
        })
    }

    /// Drop every reference held through `connection`, on every channel
    ///
    /// Returns the channels the connection was removed from. Channels are
    /// visited one at a time, so other channels stay available throughout.
    pub fn release_connection(&self, connection: ConnectionId) -> Vec<String> {
        let candidates: Vec<String> = self
            .channels
            .iter()
            .filter(|entry| entry.value().contains_key(&connection))
            .map(|entry| entry.key().clone())
            .collect();

        let mut released = Vec::with_capacity(candidates.len());
        for channel in candidates {
            let removed = self
                .channels
                .get_mut(&channel)
                .and_then(|mut subscribers| subscribers.remove(&connection));

            if removed.is_some() {
                self.remove_if_empty(&channel);
                released.push(channel);
            }
        }

        tracing::debug!(
            connection = %connection,
            channels = released.len(),
            "Released connection subscriptions"
        );

        released
    }

    fn remove_if_empty(&self, channel: &str) -> bool {
        self.channels
            .remove_if(channel, |_, subscribers| subscribers.is_empty())
            .is_some()
    }

    /// Snapshot the connections currently subscribed to `channel`
    pub fn subscribers(&self, channel: &str) -> Vec<ChannelSubscriber> {
        match self.channels.get(channel) {
            Some(subscribers) => subscribers
                .values()
                .map(|entry| ChannelSubscriber {
                    handle: entry.handle.clone(),
                    peers: entry
                        .peers
                        .iter()
                        .map(|(peer, count)| (peer.clone(), *count))
                        .collect(),
                })
                .collect(),
            None => {
                tracing::debug!(channel, "No subscribers");
                Vec::new()
            }
        }
    }

    /// Call `f` once per connection subscribed to `channel`
    ///
    /// `f` runs on a snapshot taken before the first call, with no lock
    /// held, so it may block on I/O or re-enter the table.
    pub fn for_each_channel<F>(&self, channel: &str, mut f: F)
    where
        F: FnMut(&ChannelSubscriber),
    {
        for subscriber in self.subscribers(channel) {
            f(&subscriber);
        }
    }

    /// Call `f` for every (channel, connection, peer, count) tuple
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SubscriptionRow),
    {
        for row in self.rows() {
            f(&row);
        }
    }

    /// Collect every (channel, connection, peer, count) tuple
    pub fn rows(&self) -> Vec<SubscriptionRow> {
        let mut rows = Vec::new();
        for channel in self.channels.iter() {
            for (connection, entry) in channel.value() {
                for (peer_name, count) in &entry.peers {
                    rows.push(SubscriptionRow {
                        channel: channel.key().clone(),
                        connection: *connection,
                        peer_name: peer_name.clone(),
                        count: *count,
                    });
                }
            }
        }
        rows
    }

    /// Current count for (channel, connection, peer); 0 if absent
    pub fn count(&self, channel: &str, connection: ConnectionId, peer_name: &str) -> u32 {
        self.channels
            .get(channel)
            .and_then(|subscribers| {
                subscribers
                    .get(&connection)
                    .and_then(|entry| entry.peers.get(peer_name).copied())
            })
            .unwrap_or(0)
    }

    /// Whether `channel` has at least one subscriber
    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Number of channels with at least one subscriber
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Whether the table holds no subscription at all
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::protocol::BusEvent;

    fn handle(id: u64) -> (ConnectionHandle, mpsc::UnboundedReceiver<BusEvent>) {
        ConnectionHandle::channel(ConnectionId::new(id), format!("conn-{}", id))
    }

    #[test]
    fn test_add_ref_transitions() {
        let table = SubscriptionTable::new();
        let (conn1, _rx1) = handle(1);
        let (conn2, _rx2) = handle(2);

        let first = table.add_ref("news", &conn1, "peer1");
        assert_eq!(
            first,
            AddRefOutcome {
                count: 1,
                first_for_peer: true,
                first_for_connection: true,
                first_for_channel: true,
            }
        );

        let second = table.add_ref("news", &conn1, "peer1");
        assert_eq!(second.count, 2);
        assert!(!second.first_for_peer);
        assert!(!second.first_for_connection);
        assert!(!second.first_for_channel);

        let other_peer = table.add_ref("news", &conn1, "peer2");
        assert!(other_peer.first_for_peer);
        assert!(!other_peer.first_for_connection);

        let other_conn = table.add_ref("news", &conn2, "peer1");
        assert!(other_conn.first_for_connection);
        assert!(!other_conn.first_for_channel);
    }

    #[test]
    fn test_count_tracks_add_minus_release() {
        let table = SubscriptionTable::new();
        let (conn, _rx) = handle(1);
        let id = conn.id();

        // +3 -1 +1 -2 -1 = 0
        let ops = [true, true, true, false, true, false, false, false];
        let mut expected: u32 = 0;
        for add in ops {
            if add {
                table.add_ref("news", &conn, "peer1");
                expected += 1;
            } else {
                table.release("news", id, "peer1");
                expected = expected.saturating_sub(1);
            }
            assert_eq!(table.count("news", id, "peer1"), expected);
        }

        assert!(!table.has_channel("news"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_transitions() {
        let table = SubscriptionTable::new();
        let (conn, _rx) = handle(1);
        let id = conn.id();

        table.add_ref("news", &conn, "peer1");
        table.add_ref("news", &conn, "peer1");
        table.add_ref("news", &conn, "peer2");

        let outcome = table.release("news", id, "peer1").unwrap();
        assert_eq!(outcome.remaining, 1);
        assert!(!outcome.last_for_peer);

        let outcome = table.release("news", id, "peer1").unwrap();
        assert!(outcome.last_for_peer);
        assert!(!outcome.last_for_connection);

        let outcome = table.release("news", id, "peer2").unwrap();
        assert!(outcome.last_for_connection);
        assert!(outcome.channel_removed);
        assert_eq!(table.channel_count(), 0);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let table = SubscriptionTable::new();
        let (conn, _rx) = handle(1);

        assert!(table.release("missing", conn.id(), "peer1").is_none());

        table.add_ref("news", &conn, "peer1");
        assert!(table.release("news", ConnectionId::new(99), "peer1").is_none());
        assert!(table.release("news", conn.id(), "ghost").is_none());
        assert_eq!(table.count("news", conn.id(), "peer1"), 1);
    }

    #[test]
    fn test_release_all() {
        let table = SubscriptionTable::new();
        let (conn, _rx) = handle(1);

        for _ in 0..5 {
            table.add_ref("news", &conn, "peer1");
        }
        table.add_ref("news", &conn, "peer2");

        let outcome = table.release_all("news", conn.id(), "peer1").unwrap();
        assert_eq!(outcome.remaining, 0);
        assert!(outcome.last_for_peer);
        assert!(!outcome.last_for_connection);
        assert_eq!(table.count("news", conn.id(), "peer1"), 0);
        assert_eq!(table.count("news", conn.id(), "peer2"), 1);
    }

    #[test]
    fn test_release_connection() {
        let table = SubscriptionTable::new();
        let (conn1, _rx1) = handle(1);
        let (conn2, _rx2) = handle(2);

        table.add_ref("a", &conn1, "peer1");
        table.add_ref("b", &conn1, "peer1");
        table.add_ref("b", &conn1, "peer3");
        table.add_ref("b", &conn2, "peer2");
        table.add_ref("c", &conn2, "peer2");

        let mut released = table.release_connection(conn1.id());
        released.sort();
        assert_eq!(released, vec!["a".to_string(), "b".to_string()]);

        assert!(table.rows().iter().all(|row| row.connection != conn1.id()));
        assert!(!table.has_channel("a"));
        assert!(table.has_channel("b"));
        assert!(table.has_channel("c"));

        // Second teardown finds nothing
        assert!(table.release_connection(conn1.id()).is_empty());
    }

    #[test]
    fn test_subscribers_snapshot() {
        let table = SubscriptionTable::new();
        let (conn1, _rx1) = handle(1);
        let (conn2, _rx2) = handle(2);

        table.add_ref("news", &conn1, "peer1");
        table.add_ref("news", &conn1, "peer1");
        table.add_ref("news", &conn2, "peer2");

        let mut seen = Vec::new();
        table.for_each_channel("news", |subscriber| {
            seen.push((subscriber.connection(), subscriber.total_count()));
        });
        seen.sort();
        assert_eq!(seen, vec![(conn1.id(), 2), (conn2.id(), 1)]);

        // Mutating while holding a snapshot does not affect it
        let snapshot = table.subscribers("news");
        table.release_connection(conn2.id());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(table.subscribers("news").len(), 1);
    }

    #[test]
    fn test_for_each_channel_reentrant() {
        let table = SubscriptionTable::new();
        let (conn, _rx) = handle(1);
        table.add_ref("news", &conn, "peer1");

        table.for_each_channel("news", |subscriber| {
            table.release_connection(subscriber.connection());
        });
        assert!(table.is_empty());
    }

    #[test]
    fn test_unknown_channel_has_no_subscribers() {
        let table = SubscriptionTable::new();
        let mut calls = 0;
        table.for_each_channel("nobody", |_| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_rows() {
        let table = SubscriptionTable::new();
        let (conn, _rx) = handle(1);

        table.add_ref("A", &conn, "peer1");
        table.add_ref("B", &conn, "peer1");
        table.add_ref("B", &conn, "peer1");

        let mut rows: Vec<StateRow> = table.rows().into_iter().map(StateRow::from).collect();
        rows.sort_by(|a, b| a.channel.cmp(&b.channel));

        assert_eq!(
            rows,
            vec![
                StateRow {
                    channel: "A".into(),
                    peer_name: "peer1".into(),
                    count: 1
                },
                StateRow {
                    channel: "B".into(),
                    peer_name: "peer1".into(),
                    count: 2
                },
            ]
        );

        let mut visited = 0;
        table.for_each(|_| visited += 1);
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_concurrent_add_release_same_channel() {
        let table = Arc::new(SubscriptionTable::new());
        let (conn, _rx) = handle(1);

        std::thread::scope(|scope| {
            for t in 0..8 {
                let table = Arc::clone(&table);
                let conn = conn.clone();
                scope.spawn(move || {
                    let peer = format!("peer{}", t % 2);
                    for _ in 0..500 {
                        table.add_ref("hot", &conn, &peer);
                    }
                    for _ in 0..500 {
                        table.release("hot", conn.id(), &peer);
                    }
                });
            }
        });

        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_channels_and_teardown() {
        let table = Arc::new(SubscriptionTable::new());
        let (conn1, _rx1) = handle(1);
        let (conn2, _rx2) = handle(2);

        std::thread::scope(|scope| {
            for t in 0..4 {
                let table = Arc::clone(&table);
                let conn1 = conn1.clone();
                let conn2 = conn2.clone();
                scope.spawn(move || {
                    for i in 0..200 {
                        let channel = format!("ch-{}-{}", t, i);
                        table.add_ref(&channel, &conn1, "peer1");
                        table.add_ref(&channel, &conn2, "peer2");
                    }
                });
            }
        });

        let released = table.release_connection(conn1.id());
        assert_eq!(released.len(), 800);
        assert_eq!(table.channel_count(), 800);
        assert!(table.rows().iter().all(|row| row.connection == conn2.id()));
    }
}
