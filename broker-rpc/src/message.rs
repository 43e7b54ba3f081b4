use std::{fmt, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque token linking a request to its reply
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker-level message properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    /// Destination to send a reply to
    pub reply_to: Option<String>,
    /// Request correlation id
    pub correlation_id: Option<CorrelationId>,
    /// Broker drops the message if it isn't consumed in time
    pub expiration: Option<Duration>,
}

/// Message as it goes through the broker. Payload is never inspected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub properties: Properties,
    pub payload: Bytes,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            properties: Properties::default(),
            payload: payload.into(),
        }
    }

    /// Request message, which expects a reply into `reply_to`
    pub fn request(
        payload: impl Into<Bytes>,
        reply_to: &str,
        correlation_id: CorrelationId,
        expiration: Option<Duration>,
    ) -> Self {
        Self {
            properties: Properties {
                reply_to: Some(reply_to.to_owned()),
                correlation_id: Some(correlation_id),
                expiration,
            },
            payload: payload.into(),
        }
    }

    /// Reply to the `request`. Copies request correlation id
    pub fn reply_to(request: &Message, payload: impl Into<Bytes>) -> Self {
        Self {
            properties: Properties {
                reply_to: None,
                correlation_id: request.properties.correlation_id.clone(),
                expiration: None,
            },
            payload: payload.into(),
        }
    }

    /// Expiration in whole milliseconds, as it goes on the wire.
    /// Rounded up and never zero, which would expire the message immediately
    pub fn expiration_ms(&self) -> Option<u64> {
        self.properties
            .expiration
            .map(|ttl| crate::config::whole_millis(ttl).max(1))
    }
}

/// Message delivered from a queue
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the message was consumed from
    pub queue: String,
    pub message: Message,
}
