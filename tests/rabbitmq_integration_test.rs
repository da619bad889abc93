//! Live broker tests. Run with `cargo test -- --ignored` against a local RabbitMQ.
//! A complete `COURIER_*` environment (or `config/courier.toml`) selects another broker.

mod common;

use common::*;
use courier_bus::config::ConfigLoader;
use courier_bus::dispatch::HandlerRegistry;
use courier_bus::{MessageBus, OutboundMessage, Resolution};
use uuid::Uuid;

#[tokio::test]
#[ignore = "requires RabbitMQ running"]
async fn test_round_trip_against_rabbitmq() {
    courier_bus::logging::init_structured_logging();

    let service_name = format!("courier_it_{}", Uuid::new_v4().simple());
    let mut config = ConfigLoader::new()
        .load()
        .unwrap_or_else(|_| test_config(1));
    config.app_name = APP_NAME.to_string();
    config.service_name = service_name.clone();
    config.retry_delay_seconds = 1;

    let mut registry = HandlerRegistry::new();
    registry
        .on("it.created", |message, outcomes| async move {
            let _ = outcomes.success(message.id, Vec::new());
        })
        .unwrap();

    let bus = MessageBus::connect(config, registry).await.unwrap();
    let mut resolutions = bus.resolutions();
    bus.start().await.unwrap();
    // Provisioning a second time against a live broker must not fail
    bus.provision().await.unwrap();

    bus.publish(
        &OutboundMessage::new("it.created", b"{}".to_vec()).with_id("live-1"),
        None,
    )
    .await
    .unwrap();

    assert_eq!(
        next_resolution(&mut resolutions).await,
        Resolution::Acked {
            delivery_id: "live-1".into(),
            published: 0,
            failed: 0
        }
    );
    bus.disconnect().await.unwrap();
}
