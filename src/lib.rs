//! # ipc-bus
//!
//! Process-crossing publish/subscribe and request/reply message bus.
//!
//! One process runs an [`IpcBusBroker`]; every other process connects an
//! [`IpcBusClient`] to it. Clients subscribe to named channels, publish
//! messages on them, and send requests that receive exactly one reply.
//!
//! ```text
//!  Process A                 Broker                    Process B
//!  IpcBusClient ──frames──►  Dispatcher  ──frames──►  IpcBusClient
//!    on("news")              SubscriptionTable           send("news")
//!    request("math/add")     PendingRequests             on("math/add")
//! ```
//!
//! The broker reference-counts subscriptions per (channel, connection, peer),
//! so a message is delivered once per subscribed connection no matter how
//! many local listeners asked for it.
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//!
//! use ipc_bus::{BrokerConfig, BusAddress, ClientConfig, IpcBusBroker, IpcBusClient};
//! use serde_json::json;
//!
//! # async fn example() -> ipc_bus::Result<()> {
//! let broker = IpcBusBroker::new(BrokerConfig::with_address(BusAddress::port(0)));
//! broker.start(None).await?;
//!
//! let service = IpcBusClient::connect(ClientConfig::new(broker.bus_address())).await?;
//! service.on("echo", |event, args| {
//!     if let Some(request) = &event.request {
//!         request.resolve(args.first().cloned().unwrap_or_default());
//!     }
//! })?;
//!
//! let caller = IpcBusClient::connect(ClientConfig::new(broker.bus_address())).await?;
//! let reply = caller.request("echo", vec![json!("hi")], Duration::from_secs(1)).await?;
//! assert_eq!(reply.payload, json!("hi"));
//!
//! broker.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;

pub use address::BusAddress;
pub use client::{ClientConfig, IpcBusClient, IpcBusEvent, RequestHandle, RequestResponse};
pub use error::{Error, Result};
pub use server::{BrokerConfig, IpcBusBroker, StartStatus};
pub use stats::BrokerStatsSnapshot;
