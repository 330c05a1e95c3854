//! Pending request table
//!
//! Remembers which connection must receive the answer for each reply
//! channel. An entry is removed the first time it is resolved or cancelled,
//! which makes delivery exactly-once regardless of how many responders
//! answer.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::connection::{ConnectionHandle, ConnectionId};

#[derive(Debug)]
struct PendingRequest {
    handle: ConnectionHandle,
    registered_at: Instant,
}

/// Reply channel -> requesting connection
pub struct PendingRequests {
    requests: DashMap<String, PendingRequest>,
}

impl PendingRequests {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
        }
    }

    /// Record that answers on `reply_channel` go to `handle`
    ///
    /// A duplicate registration replaces the previous requester.
    pub fn register(&self, reply_channel: &str, handle: &ConnectionHandle) {
        let previous = self.requests.insert(
            reply_channel.to_string(),
            PendingRequest {
                handle: handle.clone(),
                registered_at: Instant::now(),
            },
        );

        if let Some(previous) = previous {
            tracing::warn!(
                reply_channel,
                previous = %previous.handle.id(),
                connection = %handle.id(),
                "Reply channel registered twice"
            );
        }
    }

    /// Take the requester for `reply_channel`, removing the entry
    ///
    /// Only the first caller gets `Some`.
    pub fn resolve(&self, reply_channel: &str) -> Option<ConnectionHandle> {
        self.requests
            .remove(reply_channel)
            .map(|(_, pending)| {
                tracing::trace!(
                    reply_channel,
                    elapsed = ?pending.registered_at.elapsed(),
                    "Reply resolved"
                );
                pending.handle
            })
    }

    /// Drop a pending entry; unknown reply channels are ignored
    pub fn cancel(&self, reply_channel: &str) -> bool {
        self.requests.remove(reply_channel).is_some()
    }

    /// Drop every entry whose requester is `connection`
    pub fn release_connection(&self, connection: ConnectionId) -> usize {
        let before = self.requests.len();
        self.requests
            .retain(|_, pending| pending.handle.id() != connection);
        before.saturating_sub(self.requests.len())
    }

    /// Drop entries older than `max_age`
    ///
    /// Requests whose requester never cancels would otherwise stay forever.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let before = self.requests.len();
        self.requests
            .retain(|_, pending| pending.registered_at.elapsed() < max_age);
        before.saturating_sub(self.requests.len())
    }

    /// Whether `reply_channel` is awaiting an answer
    pub fn contains(&self, reply_channel: &str) -> bool {
        self.requests.contains_key(reply_channel)
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no request is outstanding
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_resolve_is_exactly_once() {
        let pending = PendingRequests::new();
        let (handle, _rx) = ConnectionHandle::channel(ConnectionId::new(1), "requester");

        pending.register("replyChannel/a", &handle);
        assert!(pending.contains("replyChannel/a"));

        let first = pending.resolve("replyChannel/a");
        assert_eq!(first.map(|h| h.id()), Some(ConnectionId::new(1)));
        assert!(pending.resolve("replyChannel/a").is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_cancel() {
        let pending = PendingRequests::new();
        let (handle, _rx) = ConnectionHandle::channel(ConnectionId::new(1), "requester");

        assert!(!pending.cancel("replyChannel/missing"));

        pending.register("replyChannel/a", &handle);
        assert!(pending.cancel("replyChannel/a"));
        assert!(pending.resolve("replyChannel/a").is_none());
    }

    #[test]
    fn test_release_connection() {
        let pending = PendingRequests::new();
        let (conn1, _rx1) = ConnectionHandle::channel(ConnectionId::new(1), "one");
        let (conn2, _rx2) = ConnectionHandle::channel(ConnectionId::new(2), "two");

        pending.register("replyChannel/a", &conn1);
        pending.register("replyChannel/b", &conn1);
        pending.register("replyChannel/c", &conn2);

        assert_eq!(pending.release_connection(conn1.id()), 2);
        assert_eq!(pending.len(), 1);
        assert!(pending.contains("replyChannel/c"));
    }

    #[test]
    fn test_purge_older_than() {
        let pending = PendingRequests::new();
        let (conn, _rx) = ConnectionHandle::channel(ConnectionId::new(1), "one");

        pending.register("replyChannel/a", &conn);
        assert_eq!(pending.purge_older_than(Duration::from_secs(60)), 0);
        assert_eq!(pending.purge_older_than(Duration::ZERO), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_concurrent_resolvers() {
        let pending = Arc::new(PendingRequests::new());
        let (conn, _rx) = ConnectionHandle::channel(ConnectionId::new(1), "one");
        pending.register("replyChannel/race", &conn);

        let winners = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let pending = Arc::clone(&pending);
                let winners = Arc::clone(&winners);
                scope.spawn(move || {
                    if pending.resolve("replyChannel/race").is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
