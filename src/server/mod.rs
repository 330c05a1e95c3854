//! Broker side of the bus
//!
//! [`IpcBusBroker`] accepts client connections and routes their commands
//! through a shared [`Dispatcher`].

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod listener;

pub use config::BrokerConfig;
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use listener::{IpcBusBroker, StartStatus};
