//! Client-to-broker commands

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command sent by a client to the broker
///
/// Encoded as a JSON object tagged by its `command` field. Tags the broker
/// does not know decode to [`BusCommand::Unknown`] and are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BusCommand {
    /// Add one reference for `peer_name` on `channel`
    SubscribeChannel { channel: String, peer_name: String },

    /// Drop one reference, or every reference when `unsubscribe_all` is set
    UnsubscribeChannel {
        channel: String,
        peer_name: String,
        #[serde(default)]
        unsubscribe_all: bool,
    },

    /// Publish `args` to every subscriber of `channel`
    SendMessage {
        channel: String,
        peer_name: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Publish a request; the reply must come back on `reply_channel`
    RequestMessage {
        channel: String,
        peer_name: String,
        reply_channel: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Answer a request. `payload` is the value when `resolve` is true and
    /// the rejection reason otherwise.
    RequestResponse {
        reply_channel: String,
        peer_name: String,
        resolve: bool,
        #[serde(default)]
        payload: Value,
    },

    /// Requester gave up waiting
    RequestCancel { reply_channel: String },

    /// Ask for a snapshot of every subscription
    QueryState { reply_channel: String },

    /// Any command this version does not understand
    #[serde(other)]
    Unknown,
}

impl BusCommand {
    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubscribeChannel { .. } => "subscribeChannel",
            Self::UnsubscribeChannel { .. } => "unsubscribeChannel",
            Self::SendMessage { .. } => "sendMessage",
            Self::RequestMessage { .. } => "requestMessage",
            Self::RequestResponse { .. } => "requestResponse",
            Self::RequestCancel { .. } => "requestCancel",
            Self::QueryState { .. } => "queryState",
            Self::Unknown => "unknown",
        }
    }

    /// Channel or reply channel this command addresses
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::SubscribeChannel { channel, .. }
            | Self::UnsubscribeChannel { channel, .. }
            | Self::SendMessage { channel, .. }
            | Self::RequestMessage { channel, .. } => Some(channel),
            Self::RequestResponse { reply_channel, .. }
            | Self::RequestCancel { reply_channel }
            | Self::QueryState { reply_channel } => Some(reply_channel),
            Self::Unknown => None,
        }
    }
}
