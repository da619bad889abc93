//! # Broker Provider Enum
//!
//! Enum dispatch over broker implementations, so the bus stays non-generic and the hot
//! path (ack/nack/publish) avoids vtable indirection.

use super::providers::{InMemoryBroker, RabbitMqBroker};
use super::traits::{DeliveryStream, MessageBroker};
use super::types::{ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions};
use crate::error::BusResult;

/// # Variants
///
/// - `RabbitMq` - AMQP 0.9.1 via the lapin crate
/// - `InMemory` - in-process broker emulation for tests and local development
#[derive(Debug)]
pub enum BrokerProvider {
    RabbitMq(RabbitMqBroker),
    InMemory(InMemoryBroker),
}

impl BrokerProvider {
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::RabbitMq(b) => b.provider_name(),
            Self::InMemory(b) => b.provider_name(),
        }
    }

    pub async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BusResult<()> {
        match self {
            Self::RabbitMq(b) => b.assert_exchange(name, kind, options).await,
            Self::InMemory(b) => b.assert_exchange(name, kind, options).await,
        }
    }

    pub async fn assert_queue(&self, name: &str, options: &QueueOptions) -> BusResult<()> {
        match self {
            Self::RabbitMq(b) => b.assert_queue(name, options).await,
            Self::InMemory(b) => b.assert_queue(name, options).await,
        }
    }

    pub async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> BusResult<()> {
        match self {
            Self::RabbitMq(b) => b.bind_exchange(destination, source, routing_key).await,
            Self::InMemory(b) => b.bind_exchange(destination, source, routing_key).await,
        }
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        match self {
            Self::RabbitMq(b) => b.bind_queue(queue, exchange, routing_key).await,
            Self::InMemory(b) => b.bind_queue(queue, exchange, routing_key).await,
        }
    }

    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<DeliveryStream> {
        match self {
            Self::RabbitMq(b) => b.consume(queue, consumer_tag).await,
            Self::InMemory(b) => b.consume(queue, consumer_tag).await,
        }
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> BusResult<()> {
        match self {
            Self::RabbitMq(b) => b.publish(exchange, routing_key, body, properties).await,
            Self::InMemory(b) => b.publish(exchange, routing_key, body, properties).await,
        }
    }

    pub async fn ack(&self, delivery_tag: u64) -> BusResult<()> {
        match self {
            Self::RabbitMq(b) => b.ack(delivery_tag).await,
            Self::InMemory(b) => b.ack(delivery_tag).await,
        }
    }

    pub async fn nack(&self, delivery_tag: u64, requeue: bool, multiple: bool) -> BusResult<()> {
        match self {
            Self::RabbitMq(b) => b.nack(delivery_tag, requeue, multiple).await,
            Self::InMemory(b) => b.nack(delivery_tag, requeue, multiple).await,
        }
    }

    pub async fn close_channel(&self) -> BusResult<()> {
        match self {
            Self::RabbitMq(b) => b.close_channel().await,
            Self::InMemory(b) => b.close_channel().await,
        }
    }

    pub async fn close_connection(&self) -> BusResult<()> {
        match self {
            Self::RabbitMq(b) => b.close_connection().await,
            Self::InMemory(b) => b.close_connection().await,
        }
    }

    pub fn is_channel_open(&self) -> bool {
        match self {
            Self::RabbitMq(b) => b.is_channel_open(),
            Self::InMemory(b) => b.is_channel_open(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Self::RabbitMq(b) => b.is_connected(),
            Self::InMemory(b) => b.is_connected(),
        }
    }
}

impl From<RabbitMqBroker> for BrokerProvider {
    fn from(broker: RabbitMqBroker) -> Self {
        Self::RabbitMq(broker)
    }
}

impl From<InMemoryBroker> for BrokerProvider {
    fn from(broker: InMemoryBroker) -> Self {
        Self::InMemory(broker)
    }
}
