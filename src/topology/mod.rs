//! # Topology Provisioning
//!
//! Declares the durable exchange and queue graph a service needs for routed delivery with
//! delayed retry:
//!
//! ```text
//!  main_bus (fanout) ──""──▶ <svc> (topic) ──<topic>──▶ <svc>_queue
//!                              ▲                           │ nack(requeue=false)
//!                              │ TTL expiry                ▼
//!                      <svc>_queue_retry ◀──#── <svc>_dlx (fanout)
//! ```
//!
//! A rejected message leaves the primary queue through the dead-letter exchange, waits in
//! the retry queue for `retry_delay_seconds`, then expires back into the service exchange
//! under its original routing key. The broker counts each pass in the `x-death` header.
//!
//! Provisioning is idempotent: every step is an AMQP declare, so running it again against
//! an identical topology is a no-op, and a conflicting existing declaration fails with
//! [`BusError::Topology`](crate::error::BusError::Topology) instead of being retried.

use tracing::{debug, info};

use crate::broker::{BrokerProvider, ExchangeKind, ExchangeOptions, QueueOptions};
use crate::constants::{naming, MAIN_BUS_EXCHANGE};
use crate::error::BusResult;

/// Names and retry settings derived from a service name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    pub service_exchange: String,
    pub dead_letter_exchange: String,
    pub main_bus_exchange: String,
    pub primary_queue: String,
    pub retry_queue: String,
    pub retry_delay_seconds: u64,
}

impl TopologyDescriptor {
    pub fn for_service(service_name: &str, retry_delay_seconds: u64) -> Self {
        Self {
            service_exchange: naming::service_exchange(service_name),
            dead_letter_exchange: naming::dead_letter_exchange(service_name),
            main_bus_exchange: MAIN_BUS_EXCHANGE.to_string(),
            primary_queue: naming::primary_queue(service_name),
            retry_queue: naming::retry_queue(service_name),
            retry_delay_seconds,
        }
    }

    /// Retry queue `x-message-ttl`, saturating at the AMQP limit
    pub fn retry_ttl_ms(&self) -> u32 {
        u32::try_from(self.retry_delay_seconds.saturating_mul(1000)).unwrap_or(u32::MAX)
    }

    pub fn primary_queue_options(&self) -> QueueOptions {
        QueueOptions::durable().with_dead_letter_exchange(self.dead_letter_exchange.clone())
    }

    pub fn retry_queue_options(&self) -> QueueOptions {
        QueueOptions::durable()
            .with_dead_letter_exchange(self.service_exchange.clone())
            .with_message_ttl_ms(self.retry_ttl_ms())
    }
}

/// Runs the declare sequence for a [`TopologyDescriptor`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TopologyProvisioner;

impl TopologyProvisioner {
    pub async fn provision(broker: &BrokerProvider, topology: &TopologyDescriptor) -> BusResult<()> {
        let exchange_options = ExchangeOptions::durable();

        for (name, kind) in [
            (&topology.service_exchange, ExchangeKind::Topic),
            (&topology.dead_letter_exchange, ExchangeKind::Fanout),
            (&topology.main_bus_exchange, ExchangeKind::Fanout),
        ] {
            broker.assert_exchange(name, kind, exchange_options).await?;
            debug!(exchange = %name, kind = %kind, "Exchange asserted");
        }

        broker
            .assert_queue(&topology.primary_queue, &topology.primary_queue_options())
            .await?;
        debug!(queue = %topology.primary_queue, "Primary queue asserted");

        broker
            .bind_exchange(&topology.service_exchange, &topology.main_bus_exchange, "")
            .await?;
        debug!(
            source = %topology.main_bus_exchange,
            destination = %topology.service_exchange,
            "Service exchange bound to main bus"
        );

        broker
            .assert_queue(&topology.retry_queue, &topology.retry_queue_options())
            .await?;
        debug!(
            queue = %topology.retry_queue,
            ttl_ms = topology.retry_ttl_ms(),
            "Retry queue asserted"
        );

        // Fanout ignores the key; "#" keeps the binding meaningful if the DLX kind changes
        broker
            .bind_queue(&topology.retry_queue, &topology.dead_letter_exchange, "#")
            .await?;

        info!(
            provider = broker.provider_name(),
            service_exchange = %topology.service_exchange,
            primary_queue = %topology.primary_queue,
            retry_delay_seconds = topology.retry_delay_seconds,
            "Topology provisioned"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::error::BusError;

    fn descriptor() -> TopologyDescriptor {
        TopologyDescriptor::for_service("orders", 5)
    }

    #[test]
    fn test_descriptor_names() {
        let topology = descriptor();
        assert_eq!(topology.service_exchange, "orders");
        assert_eq!(topology.dead_letter_exchange, "orders_dlx");
        assert_eq!(topology.main_bus_exchange, "main_bus");
        assert_eq!(topology.primary_queue, "orders_queue");
        assert_eq!(topology.retry_queue, "orders_queue_retry");
        assert_eq!(topology.retry_ttl_ms(), 5000);
    }

    #[test]
    fn test_retry_ttl_saturates() {
        let topology = TopologyDescriptor::for_service("orders", u64::MAX);
        assert_eq!(topology.retry_ttl_ms(), u32::MAX);
    }

    #[test]
    fn test_queue_dead_letter_targets() {
        let topology = descriptor();
        assert_eq!(
            topology.primary_queue_options().dead_letter_exchange.as_deref(),
            Some("orders_dlx")
        );
        let retry = topology.retry_queue_options();
        assert_eq!(retry.dead_letter_exchange.as_deref(), Some("orders"));
        assert_eq!(retry.message_ttl_ms, Some(5000));
        assert!(retry.durable);
        assert!(!retry.auto_delete);
    }

    #[tokio::test]
    async fn test_provision_declares_graph() {
        let memory = InMemoryBroker::new();
        let broker = BrokerProvider::from(memory.clone());

        TopologyProvisioner::provision(&broker, &descriptor())
            .await
            .unwrap();

        assert_eq!(memory.exchange_kind("orders"), Some(ExchangeKind::Topic));
        assert_eq!(memory.exchange_kind("orders_dlx"), Some(ExchangeKind::Fanout));
        assert_eq!(memory.exchange_kind("main_bus"), Some(ExchangeKind::Fanout));
        assert_eq!(
            memory.exchange_bindings("orders"),
            vec![("main_bus".to_string(), String::new())]
        );
        assert_eq!(
            memory.queue_bindings("orders_queue_retry"),
            vec![("orders_dlx".to_string(), "#".to_string())]
        );
    }

    #[tokio::test]
    async fn test_conflicting_topology_surfaces_error() {
        let memory = InMemoryBroker::new();
        let broker = BrokerProvider::from(memory);
        broker
            .assert_exchange("orders", ExchangeKind::Direct, ExchangeOptions::durable())
            .await
            .unwrap();

        let result = TopologyProvisioner::provision(&broker, &descriptor()).await;
        assert!(matches!(result, Err(BusError::Topology { ref entity, .. }) if entity == "orders"));
    }
}
