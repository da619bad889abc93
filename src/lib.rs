#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, AMQP in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Courier Bus
//!
//! Topic-routed message bus core over AMQP 0.9.1 with at-least-once delivery and bounded,
//! delayed redelivery through a dead-letter/retry topology.
//!
//! ## Overview
//!
//! Each service owns a topic exchange, a primary queue, a dead-letter exchange and a retry
//! queue. Handlers receive messages for the topics they registered and report an outcome:
//!
//! - **Success**: the delivery is acknowledged and any follow-up messages are published
//! - **Error**: the delivery is rejected into the retry queue, comes back after the retry
//!   delay, and is dropped once its retry limit (default 60) is reached
//!
//! ## Module Organization
//!
//! - [`bus`] - The [`MessageBus`] façade: start, publish, subscribe, disconnect
//! - [`topology`] - Exchange/queue graph and its idempotent provisioning
//! - [`dispatch`] - Inbound consumption, handler registry and in-flight tracking
//! - [`resolver`] - Outcome signals to ack/nack decisions, retry accounting
//! - [`publisher`] - Outbound publication with identity and lineage stamping
//! - [`messaging`] - Message and outcome signal types
//! - [`broker`] - Broker abstraction with RabbitMQ and in-memory providers
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courier_bus::config::ConfigLoader;
//! use courier_bus::dispatch::HandlerRegistry;
//! use courier_bus::MessageBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new().load()?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.on("invoice.created", |message, outcomes| async move {
//!     let follow_up = message.reply("invoice.sent", message.body.clone());
//!     let _ = outcomes.success(message.id, vec![follow_up]);
//! })?;
//!
//! let bus = MessageBus::connect(config, registry).await?;
//! bus.start().await?;
//! // ... run until shutdown
//! bus.disconnect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! [`broker::InMemoryBroker`] emulates exchanges, dead-lettering, message TTL and the
//! `x-death` header, so the full retry loop runs in-process:
//!
//! ```rust
//! use courier_bus::broker::InMemoryBroker;
//! use courier_bus::config::BusConfig;
//! use courier_bus::dispatch::HandlerRegistry;
//! use courier_bus::MessageBus;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BusConfig::builder().app_name("shop").service_name("orders").build()?;
//! let bus = MessageBus::with_broker(config, HandlerRegistry::new(), InMemoryBroker::new());
//! assert_eq!(bus.topology().retry_queue, "orders_queue_retry");
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod bus;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod publisher;
pub mod resolver;
pub mod topology;

pub use bus::MessageBus;
pub use config::{BusConfig, ConfigLoader};
pub use dispatch::{HandlerRegistry, MessageHandler};
pub use error::{BusError, BusResult, UnroutableReason};
pub use messaging::{ApplicationMessage, OutboundMessage, OutcomeSender, OutcomeSignal};
pub use resolver::{DeliveryState, Resolution};
pub use topology::{TopologyDescriptor, TopologyProvisioner};
