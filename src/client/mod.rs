//! Client side of the bus
//!
//! Each process owns one [`IpcBusClient`] (or clones of it) and uses it to
//! publish, subscribe and make requests.

pub mod bus;
pub mod config;
pub mod event;
pub mod listeners;

pub use bus::IpcBusClient;
pub use config::ClientConfig;
pub use event::{IpcBusEvent, RequestHandle, RequestResponse};
pub use listeners::{Listener, ListenerId};
