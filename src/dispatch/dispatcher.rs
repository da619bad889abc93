//! # Inbound Dispatcher
//!
//! Consumes the primary queue and decides, per delivery:
//!
//! 1. `app_id` is not this application → acknowledge and discard
//! 2. `message_id` present → track in the in-flight table and hand the message to every
//!    matching handler (spawned, never awaited)
//! 3. otherwise → acknowledge and discard, since no outcome could ever resolve it
//!
//! Tracked deliveries stay unacknowledged until the outcome resolver receives a signal
//! for their identifier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::{BrokerProvider, DeliveryStream, RawDelivery};
use crate::dispatch::in_flight::{InFlightDelivery, InFlightTable};
use crate::dispatch::registry::HandlerRegistry;
use crate::error::{BusError, BusResult, UnroutableReason};
use crate::logging::{log_delivery_operation, log_error};
use crate::messaging::{ApplicationMessage, OutcomeSender};
use crate::resolver::retry::death_count;
use crate::resolver::DeliveryState;

#[derive(Debug, Default)]
struct DispatchStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    foreign: AtomicU64,
    untracked: AtomicU64,
    unhandled: AtomicU64,
    displaced: AtomicU64,
}

/// Point-in-time copy of dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    /// Tracked and handed to at least one handler
    pub dispatched: u64,
    pub foreign: u64,
    pub untracked: u64,
    /// Tracked but no local handler matched
    pub unhandled: u64,
    /// Replaced by a newer delivery with the same identifier
    pub displaced: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Tracked { delivery_id: String, handlers: usize },
    Discarded { reason: UnroutableReason },
}

#[derive(Debug, Clone)]
pub struct InboundDispatcher {
    broker: Arc<BrokerProvider>,
    registry: Arc<HandlerRegistry>,
    in_flight: InFlightTable,
    outcomes: OutcomeSender,
    app_name: String,
    primary_queue: String,
    stats: Arc<DispatchStats>,
}

impl InboundDispatcher {
    pub fn new(
        broker: Arc<BrokerProvider>,
        registry: Arc<HandlerRegistry>,
        in_flight: InFlightTable,
        outcomes: OutcomeSender,
        app_name: impl Into<String>,
        primary_queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            registry,
            in_flight,
            outcomes,
            app_name: app_name.into(),
            primary_queue: primary_queue.into(),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.stats.received.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            foreign: self.stats.foreign.load(Ordering::Relaxed),
            untracked: self.stats.untracked.load(Ordering::Relaxed),
            unhandled: self.stats.unhandled.load(Ordering::Relaxed),
            displaced: self.stats.displaced.load(Ordering::Relaxed),
        }
    }

    pub async fn handle_delivery(&self, raw: RawDelivery) -> BusResult<DispatchOutcome> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        if raw.properties.app_id.as_deref() != Some(self.app_name.as_str()) {
            self.stats.foreign.fetch_add(1, Ordering::Relaxed);
            return self
                .discard(raw, UnroutableReason::ForeignApplication)
                .await;
        }

        let delivery_id = match raw.properties.message_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                self.stats.untracked.fetch_add(1, Ordering::Relaxed);
                return self.discard(raw, UnroutableReason::MissingIdentifier).await;
            }
        };

        let retry_count = death_count(&raw.properties, &self.primary_queue);
        let message = ApplicationMessage::from_delivery(&delivery_id, &raw);

        if let Some(displaced) = self.in_flight.track(InFlightDelivery {
            delivery_id: delivery_id.clone(),
            raw,
            retry_count,
        }) {
            self.stats.displaced.fetch_add(1, Ordering::Relaxed);
            warn!(
                delivery_id = %delivery_id,
                displaced_tag = displaced.delivery_tag(),
                "Identifier already in flight; acknowledging the older delivery"
            );
            if let Err(e) = self.broker.ack(displaced.delivery_tag()).await {
                log_error(
                    "inbound_dispatcher",
                    "ack_displaced",
                    &e.to_string(),
                    Some(&delivery_id),
                );
            }
        }

        let handlers = self.registry.matching(&message.topic);
        if handlers.is_empty() {
            self.stats.unhandled.fetch_add(1, Ordering::Relaxed);
            warn!(
                delivery_id = %delivery_id,
                topic = %message.topic,
                "No local handler for topic; delivery stays in flight"
            );
        } else {
            self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        }

        for handler in &handlers {
            tokio::spawn(handler(message.clone(), self.outcomes.clone()));
        }

        debug!(
            delivery_id = %delivery_id,
            topic = %message.topic,
            retry_count = retry_count,
            handlers = handlers.len(),
            "Delivery dispatched"
        );

        Ok(DispatchOutcome::Tracked {
            delivery_id,
            handlers: handlers.len(),
        })
    }

    async fn discard(
        &self,
        raw: RawDelivery,
        reason: UnroutableReason,
    ) -> BusResult<DispatchOutcome> {
        let error = BusError::unroutable(raw.delivery_tag, reason);
        debug!(
            error = %error,
            app_id = ?raw.properties.app_id,
            topic = %raw.routing_key,
            "Discarding delivery"
        );

        self.broker.ack(raw.delivery_tag).await?;
        log_delivery_operation(
            "discard",
            raw.properties.message_id.as_deref(),
            Some(&raw.routing_key),
            None,
            &DeliveryState::Acked.to_string(),
            Some(&reason.to_string()),
        );
        Ok(DispatchOutcome::Discarded { reason })
    }

    /// Consume until the stream ends or fails
    pub async fn run(self, mut deliveries: DeliveryStream) {
        info!(queue = %self.primary_queue, "Inbound dispatcher started");

        while let Some(next) = deliveries.next().await {
            match next {
                Ok(raw) => {
                    if let Err(e) = self.handle_delivery(raw).await {
                        log_error("inbound_dispatcher", "handle_delivery", &e.to_string(), None);
                        if e.is_fatal() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    log_error(
                        "inbound_dispatcher",
                        "consume",
                        &e.to_string(),
                        Some(&self.primary_queue),
                    );
                    break;
                }
            }
        }

        info!(
            queue = %self.primary_queue,
            stats = ?self.stats(),
            "Inbound dispatcher stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, MessageBroker, MessageProperties, QueueOptions};
    use tokio::sync::mpsc;

    async fn setup(
        registry: HandlerRegistry,
    ) -> (InMemoryBroker, InboundDispatcher, InFlightTable) {
        let memory = InMemoryBroker::new();
        let broker = Arc::new(BrokerProvider::from(memory.clone()));
        broker
            .assert_queue("orders_queue", &QueueOptions::durable())
            .await
            .unwrap();
        let in_flight = InFlightTable::new();
        let (outcomes, _rx) = OutcomeSender::channel();
        let dispatcher = InboundDispatcher::new(
            broker,
            Arc::new(registry),
            in_flight.clone(),
            outcomes,
            "shop",
            "orders_queue",
        );
        (memory, dispatcher, in_flight)
    }

    /// Put a message in the queue and take its delivery so the tag is live
    async fn deliver(memory: &InMemoryBroker, properties: MessageProperties) -> RawDelivery {
        memory
            .publish("", "orders_queue", b"{}", properties)
            .await
            .unwrap();
        let mut stream = memory.consume("orders_queue", "test").await.unwrap();
        let mut delivery = stream.next().await.unwrap().unwrap();
        // Default-exchange routing used the queue name; present it under a topic
        delivery.routing_key = "order.created".into();
        delivery
    }

    fn props(app_id: Option<&str>, message_id: Option<&str>) -> MessageProperties {
        MessageProperties {
            app_id: app_id.map(str::to_string),
            message_id: message_id.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_foreign_application_is_acked() {
        let (memory, dispatcher, in_flight) = setup(HandlerRegistry::new()).await;
        let raw = deliver(&memory, props(Some("other"), Some("m1"))).await;
        let tag = raw.delivery_tag;

        let outcome = dispatcher.handle_delivery(raw).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Discarded {
                reason: UnroutableReason::ForeignApplication
            }
        );
        assert!(in_flight.is_empty());
        assert_eq!(memory.acked_tags(), vec![tag]);
        assert_eq!(dispatcher.stats().foreign, 1);
    }

    #[tokio::test]
    async fn test_missing_identifier_is_acked() {
        let (memory, dispatcher, in_flight) = setup(HandlerRegistry::new()).await;
        let raw = deliver(&memory, props(Some("shop"), None)).await;

        let outcome = dispatcher.handle_delivery(raw).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Discarded {
                reason: UnroutableReason::MissingIdentifier
            }
        );
        assert!(in_flight.is_empty());
        assert_eq!(memory.unacked_count(), 0);
        assert_eq!(dispatcher.stats().untracked, 1);
    }

    #[tokio::test]
    async fn test_tracked_delivery_reaches_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = HandlerRegistry::new();
        registry
            .on("order.*", move |message, _| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                }
            })
            .unwrap();

        let (memory, dispatcher, in_flight) = setup(registry).await;
        let raw = deliver(&memory, props(Some("shop"), Some("m1"))).await;

        let outcome = dispatcher.handle_delivery(raw).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Tracked {
                delivery_id: "m1".into(),
                handlers: 1
            }
        );
        assert!(in_flight.contains("m1"));
        assert_eq!(memory.unacked_count(), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "m1");
        assert_eq!(received.topic, "order.created");
    }

    #[tokio::test]
    async fn test_unhandled_topic_still_tracked() {
        let (memory, dispatcher, in_flight) = setup(HandlerRegistry::new()).await;
        let raw = deliver(&memory, props(Some("shop"), Some("m1"))).await;

        dispatcher.handle_delivery(raw).await.unwrap();
        assert!(in_flight.contains("m1"));
        assert_eq!(dispatcher.stats().unhandled, 1);
        assert!(memory.acked_tags().is_empty());
    }
}
