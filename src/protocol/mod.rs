//! Wire protocol
//!
//! Clients and the broker exchange length-prefixed JSON frames over a
//! persistent duplex stream:
//!
//! ```text
//! Client                                   Broker
//!   |--- subscribeChannel {channel} ------->|  addRef
//!   |--- sendMessage {channel, args} ------>|  fan-out
//!   |<-- sendMessage {channel, sender} -----|  (to every subscriber)
//!   |--- requestMessage {replyChannel} ---->|  register reply, fan-out
//!   |<-- requestResponse {replyChannel} ----|  (to the requester only)
//!   |--- requestCancel {replyChannel} ----->|  drop pending reply
//!   |--- queryState {replyChannel} -------->|
//!   |<-- requestResponse [rows] ------------|
//! ```

pub mod codec;
pub mod command;
pub mod event;
pub mod reply;

pub use codec::JsonCodec;
pub use command::BusCommand;
pub use event::{BusEvent, BusSender, StateRow};
pub use reply::{generate_reply_channel, REPLY_CHANNEL_PREFIX};
