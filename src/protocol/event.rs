//! Broker-to-client events

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of the peer that originated a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusSender {
    /// Peer name, e.g. `Node_1234`
    pub peer_name: String,
}

impl BusSender {
    /// Create a sender
    pub fn new(peer_name: impl Into<String>) -> Self {
        Self {
            peer_name: peer_name.into(),
        }
    }
}

/// An event delivered by the broker to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BusEvent {
    /// A message published on a channel the client subscribed to
    SendMessage {
        channel: String,
        sender: BusSender,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// A request published on a subscribed channel
    RequestMessage {
        channel: String,
        sender: BusSender,
        reply_channel: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// The single reply to a request this client issued
    RequestResponse {
        reply_channel: String,
        sender: BusSender,
        resolve: bool,
        #[serde(default)]
        payload: Value,
    },

    /// Any event this version does not understand
    #[serde(other)]
    Unknown,
}

impl BusEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "sendMessage",
            Self::RequestMessage { .. } => "requestMessage",
            Self::RequestResponse { .. } => "requestResponse",
            Self::Unknown => "unknown",
        }
    }
}

/// One row of a broker state snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRow {
    pub channel: String,
    pub peer_name: String,
    pub count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_message_wire_shape() {
        let event = BusEvent::RequestMessage {
            channel: "math/add".into(),
            sender: BusSender::new("Node_9"),
            reply_channel: "replyChannel/xyz".into(),
            args: vec![json!(1), json!(2)],
        };

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "requestMessage",
                "channel": "math/add",
                "sender": { "peerName": "Node_9" },
                "replyChannel": "replyChannel/xyz",
                "args": [1, 2],
            })
        );
    }

    #[test]
    fn test_unknown_event() {
        let event: BusEvent = serde_json::from_str(r#"{"event":"futureThing","x":1}"#).unwrap();
        assert_eq!(event, BusEvent::Unknown);
    }

    #[test]
    fn test_state_row_wire_shape() {
        let row = StateRow {
            channel: "news".into(),
            peer_name: "Node_1".into(),
            count: 2,
        };
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            json!({ "channel": "news", "peerName": "Node_1", "count": 2 })
        );
    }
}
