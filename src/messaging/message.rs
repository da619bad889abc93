//! # Message Types
//!
//! [`ApplicationMessage`] is what handlers receive; [`OutboundMessage`] is what the bus
//! publishes. Bodies are opaque bytes; JSON helpers are provided for the common case.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::broker::RawDelivery;
use crate::constants::headers;
use crate::error::BusResult;

/// An inbound message addressed to this application
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationMessage {
    /// Routing key the message was published under
    pub topic: String,
    pub body: Vec<u8>,
    /// Publisher-supplied identifier; also the key for outcome signals
    pub id: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Identifier of the message whose processing produced this one
    pub parent_id: Option<String>,
}

impl ApplicationMessage {
    pub fn from_delivery(delivery_id: &str, delivery: &RawDelivery) -> Self {
        let timestamp = delivery
            .properties
            .timestamp
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Self {
            topic: delivery.routing_key.clone(),
            body: delivery.body.clone(),
            id: delivery_id.to_string(),
            timestamp,
            parent_id: delivery
                .properties
                .header_str(headers::PARENT_ID)
                .map(str::to_string),
        }
    }

    /// Deserialize the body as JSON
    pub fn payload<T: DeserializeOwned>(&self) -> BusResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// A follow-up message whose parent is this one
    pub fn reply(&self, topic: impl Into<String>, body: impl Into<Vec<u8>>) -> OutboundMessage {
        OutboundMessage::new(topic, body).with_parent(self.id.clone())
    }
}

/// A message to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub body: Vec<u8>,
    pub id: String,
    pub parent_id: Option<String>,
    pub content_type: Option<String>,
}

impl OutboundMessage {
    /// New message with a fresh v4 identifier
    pub fn new(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            content_type: None,
        }
    }

    pub fn json<T: Serialize>(topic: impl Into<String>, payload: &T) -> BusResult<Self> {
        let mut message = Self::new(topic, serde_json::to_vec(payload)?);
        message.content_type = Some("application/json".to_string());
        Ok(message)
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}
