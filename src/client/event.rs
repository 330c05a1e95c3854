//! Events handed to client listeners

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{BusCommand, BusSender};

/// Envelope passed to every listener
#[derive(Debug, Clone)]
pub struct IpcBusEvent {
    /// Channel the message was published on
    pub channel: String,
    /// Peer that published it
    pub sender: BusSender,
    /// Present only when the message is a request
    pub request: Option<RequestHandle>,
}

impl IpcBusEvent {
    /// Whether this event carries a request to answer
    pub fn is_request(&self) -> bool {
        self.request.is_some()
    }
}

/// Answer side of a received request
///
/// Clones share one single-use flag: the first `resolve` or `reject`
/// sends the response, every later call does nothing and returns `false`.
#[derive(Clone)]
pub struct RequestHandle {
    reply_channel: String,
    peer_name: Arc<str>,
    outbound: mpsc::UnboundedSender<BusCommand>,
    answered: Arc<AtomicBool>,
}

impl RequestHandle {
    pub(crate) fn new(
        reply_channel: String,
        peer_name: Arc<str>,
        outbound: mpsc::UnboundedSender<BusCommand>,
    ) -> Self {
        Self {
            reply_channel,
            peer_name,
            outbound,
            answered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Reply channel this request must be answered on
    pub fn reply_channel(&self) -> &str {
        &self.reply_channel
    }

    /// Answer the request successfully
    pub fn resolve(&self, payload: impl Into<Value>) -> bool {
        self.respond(true, payload.into())
    }

    /// Answer the request with an error
    pub fn reject(&self, reason: impl Into<String>) -> bool {
        self.respond(false, Value::String(reason.into()))
    }

    /// Whether `resolve` or `reject` has already been called
    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::Acquire)
    }

    fn respond(&self, resolve: bool, payload: Value) -> bool {
        if self.answered.swap(true, Ordering::AcqRel) {
            tracing::debug!(reply_channel = %self.reply_channel, "Request already answered");
            return false;
        }

        let sent = self
            .outbound
            .send(BusCommand::RequestResponse {
                reply_channel: self.reply_channel.clone(),
                peer_name: self.peer_name.to_string(),
                resolve,
                payload,
            })
            .is_ok();

        if !sent {
            tracing::debug!(reply_channel = %self.reply_channel, "Client closed before answering");
        }
        sent
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("reply_channel", &self.reply_channel)
            .field("answered", &self.is_answered())
            .finish()
    }
}

/// Successful outcome of a request
#[derive(Debug, Clone)]
pub struct RequestResponse {
    /// Reply envelope, channel set back to the request channel
    pub event: IpcBusEvent,
    /// Value the responder resolved with
    pub payload: Value,
}

impl RequestResponse {
    /// Deserialize the payload
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> crate::error::Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| crate::error::ProtocolError::InvalidPayload(e).into())
    }
}
