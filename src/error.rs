//! # Bus Error Types
//!
//! Structured error handling for the bus core using thiserror.
//!
//! Only some of these ever reach a caller. `UnroutableDelivery` and `UnknownDelivery` are
//! resolved inside the consumption loops (acknowledge, or log and continue) and
//! `RetryExhausted` is reported through logging when a message is dropped for good.

use thiserror::Error;

/// Why an inbound delivery could not be tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnroutableReason {
    /// The delivery's `app_id` belongs to another deployed application
    ForeignApplication,
    /// The delivery carries no `message_id`, so no outcome can ever resolve it
    MissingIdentifier,
}

impl std::fmt::Display for UnroutableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForeignApplication => write!(f, "foreign_application"),
            Self::MissingIdentifier => write!(f, "missing_identifier"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Topology error: {entity}: {message}")]
    Topology { entity: String, message: String },

    #[error("Unroutable delivery (tag {delivery_tag}): {reason}")]
    UnroutableDelivery {
        delivery_tag: u64,
        reason: UnroutableReason,
    },

    #[error("Unknown delivery: {delivery_id} is not in flight")]
    UnknownDelivery { delivery_id: String },

    #[error("Retries exhausted for {delivery_id}: {retry_count} attempts reached limit {limit}")]
    RetryExhausted {
        delivery_id: String,
        retry_count: u64,
        limit: u32,
    },

    #[error("Publish to exchange '{exchange}' failed: {message}")]
    Publish { exchange: String, message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("Consume from '{queue}' failed: {message}")]
    Consume { queue: String, message: String },

    #[error("Acknowledgement of delivery tag {delivery_tag} failed: {message}")]
    Acknowledgement { delivery_tag: u64, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl BusError {
    pub fn topology(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Topology {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn unroutable(delivery_tag: u64, reason: UnroutableReason) -> Self {
        Self::UnroutableDelivery {
            delivery_tag,
            reason,
        }
    }

    pub fn unknown_delivery(delivery_id: impl Into<String>) -> Self {
        Self::UnknownDelivery {
            delivery_id: delivery_id.into(),
        }
    }

    pub fn retry_exhausted(delivery_id: impl Into<String>, retry_count: u64, limit: u32) -> Self {
        Self::RetryExhausted {
            delivery_id: delivery_id.into(),
            retry_count,
            limit,
        }
    }

    pub fn publish(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            exchange: exchange.into(),
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    pub fn consume(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consume {
            queue: queue.into(),
            message: message.into(),
        }
    }

    pub fn acknowledgement(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            delivery_tag,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether the error stops the bus (as opposed to affecting one message)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Topology { .. }
                | Self::Connection { .. }
                | Self::Channel { .. }
                | Self::Configuration { .. }
        )
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::serialization(err.to_string())
    }
}

impl From<lapin::Error> for BusError {
    fn from(err: lapin::Error) -> Self {
        BusError::channel(err.to_string())
    }
}

impl From<config::ConfigError> for BusError {
    fn from(err: config::ConfigError) -> Self {
        BusError::configuration(err.to_string())
    }
}

pub type BusResult<T> = std::result::Result<T, BusError>;
