//! Wire format for messages carried by the broadcast transport.
//!
//! Every message is a JSON object:
//!
//! ```text
//! { "event": "<channel>.<event>[.request|.response]", "instance": "<sender id>", "payload": ... }
//! ```
//!
//! Outbound messages are built from [`Envelope`]. Inbound messages are
//! classified into the closed set of [`Message`] variants; anything that does
//! not fit is reported as `MalformedMessage` so the receive loop can drop it.

use crate::config::{event_key, ProtocolConfig};
use crate::{ConnectionError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub instance: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, instance: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            instance: instance.into(),
            payload,
        }
    }

    /// Discovery beacon announcing `instance` is alive.
    pub fn beacon(instance: impl Into<String>) -> Self {
        Self::new(discovery_event(), instance, Value::Null)
    }

    pub fn into_value(self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Payload of a `<channel>.<event>.request` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    /// Correlation id echoed back by the responder.
    pub id: String,
    #[serde(default)]
    pub data: Value,
    /// Only the instance with this id should handle the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Payload of a `<channel>.<event>.response` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

/// Routing data shared by every non-beacon message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Full dotted event name, used as the local router key.
    pub event: String,
    /// Sender instance, when the envelope carried one.
    pub sender: Option<String>,
    pub payload: Value,
}

impl Delivery {
    /// Point-to-point recipient, read from `payload.target`.
    pub fn target(&self) -> Option<&str> {
        self.payload.get("target").and_then(Value::as_str)
    }

    /// Whether a receiver with identity `instance_id` should handle this.
    pub fn is_addressed_to(&self, instance_id: &str) -> bool {
        match self.target() {
            None => true,
            Some(target) => target == instance_id,
        }
    }
}

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `discovery.online` with a sender identity.
    Beacon { instance: String },
    /// `*.request` carrying a correlation id.
    Request(Delivery, RequestBody),
    /// `*.response` carrying a correlation id.
    Response(Delivery, ResponseBody),
    /// Any other application event.
    Event(Delivery),
}

#[derive(Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(default)]
    instance: Value,
    #[serde(default)]
    payload: Value,
}

impl RawEnvelope {
    /// Sender identity. Anything but a non-empty string counts as absent.
    fn sender(&self) -> Option<String> {
        self.instance
            .as_str()
            .filter(|instance| !instance.is_empty())
            .map(str::to_string)
    }
}

impl Message {
    /// Classify a raw transport message.
    pub fn parse(raw: Value) -> Result<Self> {
        if !raw.is_object() {
            return Err(ConnectionError::malformed("message is not an object"));
        }
        if raw.get("event").is_none() {
            return Err(ConnectionError::malformed("message has no event"));
        }

        let envelope: RawEnvelope = serde_json::from_value(raw)
            .map_err(|e| ConnectionError::malformed(format!("invalid envelope: {}", e)))?;

        let sender = envelope.sender();
        if envelope.event == discovery_event() {
            if let Some(instance) = &sender {
                return Ok(Message::Beacon {
                    instance: instance.clone(),
                });
            }
        }

        let delivery = Delivery {
            event: envelope.event,
            sender,
            payload: envelope.payload,
        };

        if has_suffix(&delivery.event, ProtocolConfig::REQUEST_SUFFIX) {
            let body: RequestBody = serde_json::from_value(delivery.payload.clone())
                .map_err(|e| ConnectionError::malformed(format!("invalid request body: {}", e)))?;
            return Ok(Message::Request(delivery, body));
        }

        if has_suffix(&delivery.event, ProtocolConfig::RESPONSE_SUFFIX) {
            let body: ResponseBody = serde_json::from_value(delivery.payload.clone())
                .map_err(|e| ConnectionError::malformed(format!("invalid response body: {}", e)))?;
            return Ok(Message::Response(delivery, body));
        }

        Ok(Message::Event(delivery))
    }
}

fn has_suffix(event: &str, suffix: &str) -> bool {
    event
        .rsplit_once('.')
        .map(|(_, last)| last == suffix)
        .unwrap_or(false)
}

pub(crate) fn discovery_event() -> String {
    event_key(ProtocolConfig::DISCOVERY_CHANNEL, ProtocolConfig::ONLINE_EVENT)
}
