//! # Broker Types
//!
//! Provider-neutral shapes for deliveries, message properties and declare options.

use std::collections::BTreeMap;

use crate::constants::headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Topic => write!(f, "topic"),
            Self::Fanout => write!(f, "fanout"),
            Self::Headers => write!(f, "headers"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeOptions {
    /// Survives broker restarts, never removed by the broker
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl_ms: Option<u32>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_message_ttl_ms(mut self, ttl_ms: u32) -> Self {
        self.message_ttl_ms = Some(ttl_ms);
        self
    }
}

/// AMQP field value, reduced to the shapes the bus reads and writes
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
    Timestamp(u64),
    Array(Vec<HeaderValue>),
    Table(Headers),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Timestamp(t) => i64::try_from(*t).ok(),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub app_id: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    pub delivery_mode: Option<u8>,
    pub content_type: Option<String>,
    pub headers: Headers,
}

impl MessageProperties {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(HeaderValue::as_str)
    }

    /// Dead-letter history, most recent first
    pub fn deaths(&self) -> Vec<DeathRecord> {
        match self.header(headers::DEATH) {
            Some(HeaderValue::Array(entries)) => entries
                .iter()
                .filter_map(|entry| match entry {
                    HeaderValue::Table(table) => Some(DeathRecord::from_table(table)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// One entry of the broker-maintained `x-death` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub queue: String,
    pub reason: String,
    pub exchange: String,
    pub count: u64,
    pub routing_keys: Vec<String>,
}

impl DeathRecord {
    fn from_table(table: &Headers) -> Self {
        let text = |key: &str| {
            table
                .get(key)
                .and_then(HeaderValue::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let routing_keys = match table.get("routing-keys") {
            Some(HeaderValue::Array(keys)) => keys
                .iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        Self {
            queue: text("queue"),
            reason: text("reason"),
            exchange: text("exchange"),
            count: table
                .get("count")
                .and_then(HeaderValue::as_i64)
                .and_then(|c| u64::try_from(c).ok())
                .unwrap_or(0),
            routing_keys,
        }
    }

    pub fn to_table(&self, time: u64) -> Headers {
        let mut table = Headers::new();
        table.insert("queue".into(), self.queue.clone().into());
        table.insert("reason".into(), self.reason.clone().into());
        table.insert("exchange".into(), self.exchange.clone().into());
        table.insert(
            "count".into(),
            HeaderValue::Int(i64::try_from(self.count).unwrap_or(i64::MAX)),
        );
        table.insert(
            "routing-keys".into(),
            HeaderValue::Array(
                self.routing_keys
                    .iter()
                    .map(|k| HeaderValue::String(k.clone()))
                    .collect(),
            ),
        );
        table.insert("time".into(), HeaderValue::Timestamp(time));
        table
    }
}

/// A message as handed over by the broker, before any application interpretation
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}
