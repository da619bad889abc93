//! Retry accounting through the dead-letter topology.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use courier_bus::broker::{DeathRecord, HeaderValue};
use courier_bus::constants::headers;
use courier_bus::dispatch::HandlerRegistry;
use courier_bus::{DeliveryState, OutboundMessage, Resolution};

fn failing_registry(max_retries: Option<u32>, attempts: Arc<AtomicUsize>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .on("order.created", move |message, outcomes| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                let _ = outcomes.error(message.id, max_retries);
            }
        })
        .unwrap();
    registry
}

#[tokio::test(start_paused = true)]
async fn test_failed_message_retried_until_limit() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut t = start_bus(failing_registry(Some(3), Arc::clone(&attempts)), 1).await;

    t.bus
        .publish(&OutboundMessage::new("order.created", Vec::new()).with_id("m1"), None)
        .await
        .unwrap();

    for expected in 0..3 {
        assert_eq!(
            next_resolution(&mut t.resolutions).await,
            Resolution::Retried {
                delivery_id: "m1".into(),
                retry_count: expected,
                limit: 3
            }
        );
    }
    assert_eq!(
        next_resolution(&mut t.resolutions).await,
        Resolution::Exhausted {
            delivery_id: "m1".into(),
            retry_count: 3,
            limit: 3
        }
    );

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(t.bus.in_flight_count(), 0);
    assert_eq!(t.memory.queue_depth("orders_queue"), 0);
    assert_eq!(t.memory.queue_depth("orders_queue_retry"), 0);
    assert_eq!(t.memory.nacked_tags().len(), 3);
    assert_eq!(t.memory.unacked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_for_delay() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut t = start_bus(failing_registry(Some(5), Arc::clone(&attempts)), 30).await;

    t.bus
        .publish(&OutboundMessage::new("order.created", Vec::new()), None)
        .await
        .unwrap();
    let first = next_resolution(&mut t.resolutions).await;
    assert_eq!(first.state(), Some(DeliveryState::Requeued));

    tokio::time::sleep(std::time::Duration::from_secs(29)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(t.memory.queue_depth("orders_queue_retry"), 1);

    let second = next_resolution(&mut t.resolutions).await;
    assert_eq!(second.retry_count(), Some(1));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

/// Seed a delivery whose broker history already shows `count` rejections
fn seeded_properties(id: &str, count: u64) -> courier_bus::broker::MessageProperties {
    let mut props = properties(Some(APP_NAME), Some(id));
    if count > 0 {
        let records = [
            DeathRecord {
                queue: "orders_queue_retry".into(),
                reason: "expired".into(),
                exchange: "orders_dlx".into(),
                count,
                routing_keys: vec!["order.created".into()],
            },
            DeathRecord {
                queue: "orders_queue".into(),
                reason: "rejected".into(),
                exchange: "orders".into(),
                count,
                routing_keys: vec!["order.created".into()],
            },
        ];
        props.headers.insert(
            headers::DEATH.into(),
            HeaderValue::Array(
                records
                    .iter()
                    .map(|r| HeaderValue::Table(r.to_table(0)))
                    .collect(),
            ),
        );
    }
    props
}

#[tokio::test]
async fn test_default_limit_boundary() {
    let attempts = Arc::new(AtomicUsize::new(0));
    // Long delay so nothing returns from the retry queue during the test
    let mut t = start_bus(failing_registry(None, attempts), 3600).await;

    for count in 0..=60u64 {
        publish_raw(
            &t.memory,
            "order.created",
            seeded_properties(&format!("m{count}"), count),
        )
        .await;
    }

    let mut resolved = HashMap::new();
    for _ in 0..=60 {
        let resolution = next_resolution(&mut t.resolutions).await;
        let id = resolution.delivery_id().unwrap().to_string();
        resolved.insert(id, resolution);
    }

    for count in 0..60u64 {
        let resolution = &resolved[&format!("m{count}")];
        assert_eq!(
            resolution,
            &Resolution::Retried {
                delivery_id: format!("m{count}"),
                retry_count: count,
                limit: 60
            }
        );
    }
    assert_eq!(
        resolved["m60"],
        Resolution::Exhausted {
            delivery_id: "m60".into(),
            retry_count: 60,
            limit: 60
        }
    );
    assert_eq!(t.memory.queue_depth("orders_queue_retry"), 60);
}

#[tokio::test]
async fn test_zero_max_retries_uses_default() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut t = start_bus(failing_registry(Some(0), attempts), 3600).await;

    publish_raw(&t.memory, "order.created", seeded_properties("m", 59)).await;
    assert_eq!(
        next_resolution(&mut t.resolutions).await,
        Resolution::Retried {
            delivery_id: "m".into(),
            retry_count: 59,
            limit: 60
        }
    );
}
