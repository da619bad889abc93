//! # Broker Capability Trait
//!
//! The surface the bus core consumes from a broker: one connection carrying one channel.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::types::{ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions, RawDelivery};
use crate::error::BusResult;

/// Stream of deliveries from a consumer; ends when the channel closes
pub type DeliveryStream = Pin<Box<dyn Stream<Item = BusResult<RawDelivery>> + Send>>;

/// Broker connection plus a single channel
///
/// Implementations must be safe to share between the dispatch loop, the resolver loop and
/// direct publishers, so any channel state they keep is internally synchronized.
/// Declarations follow AMQP "declare" semantics: redeclaring an identical entity succeeds,
/// redeclaring with different properties fails.
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BusResult<()>;

    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> BusResult<()>;

    /// Route messages arriving at `source` on to `destination`
    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> BusResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<DeliveryStream>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> BusResult<()>;

    async fn ack(&self, delivery_tag: u64) -> BusResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool, multiple: bool) -> BusResult<()>;

    async fn close_channel(&self) -> BusResult<()>;

    async fn close_connection(&self) -> BusResult<()>;

    fn is_channel_open(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}
