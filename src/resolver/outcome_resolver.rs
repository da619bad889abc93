//! # Outcome Resolver
//!
//! Turns outcome signals into acknowledgment decisions for tracked deliveries.
//!
//! ## State Machine
//!
//! ```text
//! tracked ──Success──────────────────────▶ Acked    (then publish resulting messages)
//!    │
//!    ├─────Error, count <  limit──────────▶ Requeued (nack, dead-letters into retry queue)
//!    │
//!    └─────Error, count >= limit──────────▶ Acked    (dropped, RetryExhausted logged)
//! ```
//!
//! `count` is the dead-letter count the delivery carried when it arrived, so a message
//! with a limit of 60 is processed at most 61 times.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerProvider;
use crate::dispatch::InFlightTable;
use crate::error::{BusError, BusResult};
use crate::logging::{log_delivery_operation, log_error};
use crate::messaging::{OutboundMessage, OutcomeSignal};
use crate::publisher::OutboundPublisher;
use crate::resolver::retry::{RetryDecision, RetryPolicy};
use crate::resolver::state::DeliveryState;

/// What a resolved signal did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Acked {
        delivery_id: String,
        published: usize,
        failed: usize,
    },
    Retried {
        delivery_id: String,
        retry_count: u64,
        limit: u32,
    },
    Exhausted {
        delivery_id: String,
        retry_count: u64,
        limit: u32,
    },
    Broadcast {
        published: usize,
        failed: usize,
    },
}

impl Resolution {
    pub fn delivery_id(&self) -> Option<&str> {
        match self {
            Self::Acked { delivery_id, .. }
            | Self::Retried { delivery_id, .. }
            | Self::Exhausted { delivery_id, .. } => Some(delivery_id),
            Self::Broadcast { .. } => None,
        }
    }

    /// Final state of the delivery, if the signal concerned one
    pub fn state(&self) -> Option<DeliveryState> {
        match self {
            Self::Acked { .. } | Self::Exhausted { .. } => Some(DeliveryState::Acked),
            Self::Retried { .. } => Some(DeliveryState::Requeued),
            Self::Broadcast { .. } => None,
        }
    }

    pub fn retry_count(&self) -> Option<u64> {
        match self {
            Self::Retried { retry_count, .. } | Self::Exhausted { retry_count, .. } => {
                Some(*retry_count)
            }
            _ => None,
        }
    }

    pub fn published(&self) -> usize {
        match self {
            Self::Acked { published, .. } | Self::Broadcast { published, .. } => *published,
            _ => 0,
        }
    }

    /// Resulting messages the broker refused
    pub fn failed(&self) -> usize {
        match self {
            Self::Acked { failed, .. } | Self::Broadcast { failed, .. } => *failed,
            _ => 0,
        }
    }
}

/// A resolution plus the first publish failure among its resulting messages
type Applied = (Resolution, Option<BusError>);

#[derive(Debug, Clone)]
pub struct OutcomeResolver {
    broker: Arc<BrokerProvider>,
    in_flight: InFlightTable,
    publisher: OutboundPublisher,
    policy: RetryPolicy,
    resolutions: broadcast::Sender<Resolution>,
}

impl OutcomeResolver {
    pub fn new(
        broker: Arc<BrokerProvider>,
        in_flight: InFlightTable,
        publisher: OutboundPublisher,
        policy: RetryPolicy,
    ) -> Self {
        let (resolutions, _) = broadcast::channel(256);
        Self {
            broker,
            in_flight,
            publisher,
            policy,
            resolutions,
        }
    }

    /// Observe resolutions made by [`run`](Self::run)
    pub fn subscribe(&self) -> broadcast::Receiver<Resolution> {
        self.resolutions.subscribe()
    }

    /// Resolve one signal. A publish failure of resulting messages is returned after the
    /// acknowledgment has been made.
    pub async fn resolve(&self, signal: OutcomeSignal) -> BusResult<Resolution> {
        match self.apply(signal).await? {
            (_, Some(publish_error)) => Err(publish_error),
            (resolution, None) => Ok(resolution),
        }
    }

    async fn apply(&self, signal: OutcomeSignal) -> BusResult<Applied> {
        match signal {
            OutcomeSignal::Success {
                delivery_id,
                resulting_messages,
            } => self.resolve_success(delivery_id, resulting_messages).await,
            OutcomeSignal::Error {
                delivery_id,
                max_retries,
            } => Ok((self.resolve_error(delivery_id, max_retries).await?, None)),
            OutcomeSignal::BroadcastSuccess { resulting_messages } => {
                let (published, failed, publish_error) =
                    self.publish_resulting(&resulting_messages).await;
                debug!(published = published, failed = failed, "Broadcast messages published");
                Ok((Resolution::Broadcast { published, failed }, publish_error))
            }
        }
    }

    async fn resolve_success(
        &self,
        delivery_id: String,
        resulting_messages: Vec<OutboundMessage>,
    ) -> BusResult<Applied> {
        let delivery = self
            .in_flight
            .take(&delivery_id)
            .ok_or_else(|| BusError::unknown_delivery(&delivery_id))?;

        self.broker.ack(delivery.delivery_tag()).await?;
        log_delivery_operation(
            "ack",
            Some(&delivery_id),
            Some(delivery.topic()),
            Some(delivery.retry_count),
            &DeliveryState::Acked.to_string(),
            None,
        );

        let (published, failed, publish_error) = self.publish_resulting(&resulting_messages).await;
        Ok((
            Resolution::Acked {
                delivery_id,
                published,
                failed,
            },
            publish_error,
        ))
    }

    async fn resolve_error(
        &self,
        delivery_id: String,
        max_retries: Option<u32>,
    ) -> BusResult<Resolution> {
        let delivery = self
            .in_flight
            .take(&delivery_id)
            .ok_or_else(|| BusError::unknown_delivery(&delivery_id))?;

        match self.policy.decide(delivery.retry_count, max_retries) {
            RetryDecision::Retry { retry_count, limit } => {
                self.broker
                    .nack(delivery.delivery_tag(), false, false)
                    .await?;
                log_delivery_operation(
                    "nack",
                    Some(&delivery_id),
                    Some(delivery.topic()),
                    Some(retry_count),
                    &DeliveryState::Requeued.to_string(),
                    Some(&format!("retry {} of {limit}", retry_count + 1)),
                );
                Ok(Resolution::Retried {
                    delivery_id,
                    retry_count,
                    limit,
                })
            }
            RetryDecision::Exhausted { retry_count, limit } => {
                self.broker.ack(delivery.delivery_tag()).await?;
                let exhausted = BusError::retry_exhausted(&delivery_id, retry_count, limit);
                error!(
                    delivery_id = %delivery_id,
                    topic = %delivery.topic(),
                    retry_count = retry_count,
                    limit = limit,
                    error = %exhausted,
                    "Message dropped after exhausting retries"
                );
                Ok(Resolution::Exhausted {
                    delivery_id,
                    retry_count,
                    limit,
                })
            }
        }
    }

    async fn publish_resulting(
        &self,
        messages: &[OutboundMessage],
    ) -> (usize, usize, Option<BusError>) {
        let (published, first_error) = self.publisher.publish_all(messages).await;
        (published, messages.len() - published, first_error)
    }

    /// Resolve signals until every sender is gone
    pub async fn run(self, mut signals: mpsc::UnboundedReceiver<OutcomeSignal>) {
        info!("Outcome resolver started");

        while let Some(signal) = signals.recv().await {
            let kind = signal.kind();
            match self.apply(signal).await {
                Ok((resolution, publish_error)) => {
                    if let Some(e) = publish_error {
                        log_error(
                            "outcome_resolver",
                            kind,
                            &e.to_string(),
                            resolution.delivery_id(),
                        );
                    }
                    // No subscribers is fine
                    let _ = self.resolutions.send(resolution);
                }
                Err(e @ BusError::UnknownDelivery { .. }) => {
                    warn!(signal = kind, error = %e, "Outcome for unknown delivery ignored");
                }
                Err(e) => {
                    log_error("outcome_resolver", kind, &e.to_string(), None);
                    if e.is_fatal() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = self.in_flight.len(), "Outcome resolver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        DeathRecord, ExchangeKind, ExchangeOptions, HeaderValue, InMemoryBroker, MessageBroker,
        MessageProperties, QueueOptions, RawDelivery,
    };
    use crate::constants::headers;
    use crate::dispatch::InFlightDelivery;
    use futures::StreamExt;

    struct Harness {
        memory: InMemoryBroker,
        in_flight: InFlightTable,
        resolver: OutcomeResolver,
    }

    async fn harness() -> Harness {
        let memory = InMemoryBroker::new();
        let broker = Arc::new(BrokerProvider::from(memory.clone()));
        broker
            .assert_exchange("main_bus", ExchangeKind::Fanout, ExchangeOptions::durable())
            .await
            .unwrap();
        broker
            .assert_queue("orders_queue", &QueueOptions::durable())
            .await
            .unwrap();
        let in_flight = InFlightTable::new();
        let publisher = OutboundPublisher::new(Arc::clone(&broker), "shop", "main_bus");
        let resolver =
            OutcomeResolver::new(broker, in_flight.clone(), publisher, RetryPolicy::default());
        Harness {
            memory,
            in_flight,
            resolver,
        }
    }

    /// Deliver one message and track it with the given prior death count
    async fn track(h: &Harness, id: &str, retry_count: u64) -> RawDelivery {
        let mut properties = MessageProperties {
            message_id: Some(id.into()),
            ..Default::default()
        };
        if retry_count > 0 {
            let record = DeathRecord {
                queue: "orders_queue".into(),
                reason: "rejected".into(),
                exchange: "orders".into(),
                count: retry_count,
                routing_keys: vec!["order.created".into()],
            };
            properties.headers.insert(
                headers::DEATH.into(),
                HeaderValue::Array(vec![HeaderValue::Table(record.to_table(0))]),
            );
        }
        h.memory
            .publish("", "orders_queue", b"{}", properties)
            .await
            .unwrap();
        let mut stream = h.memory.consume("orders_queue", id).await.unwrap();
        let raw = stream.next().await.unwrap().unwrap();
        h.in_flight.track(InFlightDelivery {
            delivery_id: id.into(),
            raw: raw.clone(),
            retry_count,
        });
        raw
    }

    #[tokio::test]
    async fn test_success_acks_and_publishes() {
        let h = harness().await;
        let raw = track(&h, "m1", 0).await;

        let resolution = h
            .resolver
            .resolve(OutcomeSignal::Success {
                delivery_id: "m1".into(),
                resulting_messages: vec![
                    OutboundMessage::new("a", Vec::new()),
                    OutboundMessage::new("b", Vec::new()),
                ],
            })
            .await
            .unwrap();

        assert_eq!(
            resolution,
            Resolution::Acked {
                delivery_id: "m1".into(),
                published: 2,
                failed: 0
            }
        );
        assert_eq!(resolution.state(), Some(DeliveryState::Acked));
        assert_eq!(h.memory.acked_tags(), vec![raw.delivery_tag]);
        assert_eq!(h.memory.published().len(), 2);
        assert!(h.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_delivery_is_error_without_side_effects() {
        let h = harness().await;
        let result = h
            .resolver
            .resolve(OutcomeSignal::Success {
                delivery_id: "missing".into(),
                resulting_messages: vec![OutboundMessage::new("a", Vec::new())],
            })
            .await;

        assert!(matches!(result, Err(BusError::UnknownDelivery { .. })));
        assert!(h.memory.acked_tags().is_empty());
        assert!(h.memory.published().is_empty());
    }

    #[tokio::test]
    async fn test_error_below_limit_nacks() {
        let h = harness().await;
        let raw = track(&h, "m1", 59).await;

        let resolution = h
            .resolver
            .resolve(OutcomeSignal::Error {
                delivery_id: "m1".into(),
                max_retries: None,
            })
            .await
            .unwrap();

        assert_eq!(resolution.state(), Some(DeliveryState::Requeued));
        assert_eq!(resolution.retry_count(), Some(59));
        assert_eq!(h.memory.nacked_tags(), vec![raw.delivery_tag]);
        assert!(h.memory.acked_tags().is_empty());
    }

    #[tokio::test]
    async fn test_error_at_limit_acks() {
        let h = harness().await;
        let raw = track(&h, "m1", 60).await;

        let resolution = h
            .resolver
            .resolve(OutcomeSignal::Error {
                delivery_id: "m1".into(),
                max_retries: Some(0),
            })
            .await
            .unwrap();

        assert_eq!(
            resolution,
            Resolution::Exhausted {
                delivery_id: "m1".into(),
                retry_count: 60,
                limit: 60
            }
        );
        assert_eq!(h.memory.acked_tags(), vec![raw.delivery_tag]);
        assert!(h.memory.nacked_tags().is_empty());
    }

    #[tokio::test]
    async fn test_second_signal_for_same_delivery_is_unknown() {
        let h = harness().await;
        track(&h, "m1", 0).await;

        h.resolver
            .resolve(OutcomeSignal::Error {
                delivery_id: "m1".into(),
                max_retries: Some(5),
            })
            .await
            .unwrap();
        let second = h
            .resolver
            .resolve(OutcomeSignal::Success {
                delivery_id: "m1".into(),
                resulting_messages: Vec::new(),
            })
            .await;

        assert!(matches!(second, Err(BusError::UnknownDelivery { .. })));
        assert_eq!(h.memory.nacked_tags().len(), 1);
        assert!(h.memory.acked_tags().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces_after_ack() {
        let h = harness().await;
        let raw = track(&h, "m1", 0).await;
        h.memory.set_publish_failure(true);

        let result = h
            .resolver
            .resolve(OutcomeSignal::Success {
                delivery_id: "m1".into(),
                resulting_messages: vec![OutboundMessage::new("a", Vec::new())],
            })
            .await;

        assert!(matches!(result, Err(BusError::Publish { .. })));
        assert_eq!(h.memory.acked_tags(), vec![raw.delivery_tag]);
    }

    #[tokio::test]
    async fn test_run_reports_ack_when_resulting_publish_fails() {
        let h = harness().await;
        let raw = track(&h, "m1", 0).await;
        h.memory.set_publish_failure(true);

        let mut resolutions = h.resolver.subscribe();
        let (outcomes, signals) = crate::messaging::OutcomeSender::channel();
        let task = tokio::spawn(h.resolver.clone().run(signals));
        outcomes
            .success(
                "m1",
                vec![
                    OutboundMessage::new("a", Vec::new()),
                    OutboundMessage::new("b", Vec::new()),
                ],
            )
            .unwrap();

        let resolution = resolutions.recv().await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Acked {
                delivery_id: "m1".into(),
                published: 0,
                failed: 2
            }
        );
        assert_eq!(resolution.failed(), 2);
        assert_eq!(h.memory.acked_tags(), vec![raw.delivery_tag]);
        assert!(h.in_flight.is_empty());

        drop(outcomes);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_success_publishes() {
        let h = harness().await;
        let resolution = h
            .resolver
            .resolve(OutcomeSignal::BroadcastSuccess {
                resulting_messages: vec![OutboundMessage::new("a", Vec::new())],
            })
            .await
            .unwrap();
        assert_eq!(
            resolution,
            Resolution::Broadcast {
                published: 1,
                failed: 0
            }
        );
        assert_eq!(resolution.state(), None);
        assert_eq!(h.memory.published().len(), 1);
    }
}
