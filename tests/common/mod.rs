//! Shared helpers for bus integration tests over the in-memory broker.

#![allow(dead_code)]

use std::time::Duration;

use courier_bus::broker::{InMemoryBroker, MessageBroker, MessageProperties};
use courier_bus::config::BusConfig;
use courier_bus::dispatch::HandlerRegistry;
use courier_bus::{ApplicationMessage, MessageBus, Resolution};
use tokio::sync::{broadcast, mpsc};

pub const APP_NAME: &str = "shop";
pub const SERVICE_NAME: &str = "orders";

pub fn test_config(retry_delay_seconds: u64) -> BusConfig {
    BusConfig::builder()
        .app_name(APP_NAME)
        .service_name(SERVICE_NAME)
        .retry_delay_seconds(retry_delay_seconds)
        .build()
        .expect("valid test config")
}

pub struct TestBus {
    pub memory: InMemoryBroker,
    pub bus: MessageBus,
    pub resolutions: broadcast::Receiver<Resolution>,
}

/// Build and start a bus over a fresh in-memory broker
pub async fn start_bus(registry: HandlerRegistry, retry_delay_seconds: u64) -> TestBus {
    let memory = InMemoryBroker::new();
    let bus = MessageBus::with_broker(test_config(retry_delay_seconds), registry, memory.clone());
    let resolutions = bus.resolutions();
    bus.start().await.expect("bus starts");
    TestBus {
        memory,
        bus,
        resolutions,
    }
}

/// Registry whose handler forwards every message on `topic` to the returned receiver
pub fn recording_registry(
    topic: &str,
) -> (HandlerRegistry, mpsc::UnboundedReceiver<ApplicationMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut registry = HandlerRegistry::new();
    registry
        .on(topic, move |message, _outcomes| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        })
        .expect("register handler");
    (registry, rx)
}

/// Publish straight onto the main bus with arbitrary properties
pub async fn publish_raw(memory: &InMemoryBroker, topic: &str, properties: MessageProperties) {
    memory
        .publish("main_bus", topic, b"{}", properties)
        .await
        .expect("raw publish");
}

pub fn properties(app_id: Option<&str>, message_id: Option<&str>) -> MessageProperties {
    MessageProperties {
        app_id: app_id.map(str::to_string),
        message_id: message_id.map(str::to_string),
        ..Default::default()
    }
}

pub async fn next_resolution(rx: &mut broadcast::Receiver<Resolution>) -> Resolution {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("resolution within timeout")
        .expect("resolution channel open")
}

pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<ApplicationMessage>) -> ApplicationMessage {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("message within timeout")
        .expect("handler channel open")
}

/// Poll until `condition` holds or fail after a few seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
