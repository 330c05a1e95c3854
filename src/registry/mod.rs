//! Broker routing tables
//!
//! Three concurrent tables hold everything the broker knows about its
//! clients. All of them are safe to use from any task without an outer lock.
//!
//! # Architecture
//!
//! ```text
//!                     Arc<Dispatcher>
//!        ┌────────────────┬────────────────┬─────────────────┐
//!        │                │                │                 │
//!        ▼                ▼                ▼                 │
//!  ConnectionRegistry  SubscriptionTable  PendingRequests    │
//!  id -> handle        channel ->         replyChannel ->    │
//!                        connection ->      handle           │
//!                          peer -> count                     │
//!        │                │                                  │
//!        └──── handle.send(event) ──► writer task ──► socket ┘
//! ```
//!
//! Fan-out iterates a snapshot of one channel's subscribers, so a
//! subscription change during delivery never blocks or invalidates it.

pub mod connection;
pub mod pending;
pub mod subscription;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use pending::PendingRequests;
pub use subscription::{
    AddRefOutcome, ChannelSubscriber, ReleaseOutcome, SubscriptionRow, SubscriptionTable,
};
