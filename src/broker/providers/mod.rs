//! # Broker Providers
//!
//! - [`RabbitMqBroker`] - production AMQP 0.9.1 broker via lapin
//! - [`InMemoryBroker`] - in-process emulation for tests and local development

pub mod in_memory;
pub mod rabbitmq;

pub use in_memory::{BrokerOperation, InMemoryBroker, PublishedMessage};
pub use rabbitmq::RabbitMqBroker;
