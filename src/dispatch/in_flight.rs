//! Deliveries awaiting an outcome, keyed by message identifier.
//!
//! Removal is atomic, so when two signals race for the same identifier exactly one of
//! them gets the delivery and makes the acknowledgment decision.

use std::sync::Arc;

use dashmap::DashMap;

use crate::broker::RawDelivery;

#[derive(Debug, Clone, PartialEq)]
pub struct InFlightDelivery {
    pub delivery_id: String,
    pub raw: RawDelivery,
    /// Dead-letter count observed when the delivery arrived
    pub retry_count: u64,
}

impl InFlightDelivery {
    pub fn delivery_tag(&self) -> u64 {
        self.raw.delivery_tag
    }

    pub fn topic(&self) -> &str {
        &self.raw.routing_key
    }
}

/// Shared handle; clones see the same table
#[derive(Debug, Clone, Default)]
pub struct InFlightTable {
    entries: Arc<DashMap<String, InFlightDelivery>>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking; returns the delivery previously tracked under the same id, if any
    pub fn track(&self, delivery: InFlightDelivery) -> Option<InFlightDelivery> {
        self.entries.insert(delivery.delivery_id.clone(), delivery)
    }

    /// Stop tracking and hand the delivery to the caller
    pub fn take(&self, delivery_id: &str) -> Option<InFlightDelivery> {
        self.entries.remove(delivery_id).map(|(_, delivery)| delivery)
    }

    pub fn contains(&self, delivery_id: &str) -> bool {
        self.entries.contains_key(delivery_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageProperties;

    fn delivery(id: &str, tag: u64) -> InFlightDelivery {
        InFlightDelivery {
            delivery_id: id.into(),
            raw: RawDelivery {
                delivery_tag: tag,
                exchange: "orders".into(),
                routing_key: "order.created".into(),
                redelivered: false,
                body: Vec::new(),
                properties: MessageProperties::default(),
            },
            retry_count: 0,
        }
    }

    #[test]
    fn test_track_and_take() {
        let table = InFlightTable::new();
        assert!(table.track(delivery("a", 1)).is_none());
        assert!(table.contains("a"));
        assert_eq!(table.len(), 1);

        let taken = table.take("a").unwrap();
        assert_eq!(taken.delivery_tag(), 1);
        assert_eq!(taken.topic(), "order.created");
        assert!(table.take("a").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_track_returns_displaced() {
        let table = InFlightTable::new();
        table.track(delivery("a", 1));
        let displaced = table.track(delivery("a", 2)).unwrap();
        assert_eq!(displaced.delivery_tag(), 1);
        assert_eq!(table.take("a").unwrap().delivery_tag(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_take_resolves_once() {
        let table = InFlightTable::new();
        table.track(delivery("a", 1));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                tokio::spawn(async move { table.take("a").is_some() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
