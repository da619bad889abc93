//! # Broker Abstraction
//!
//! Provider-agnostic access to an AMQP-style broker: topology declaration, consumption,
//! publication and acknowledgment over a single channel.
//!
//! ## Architecture
//!
//! ```text
//! MessageBus
//!     │
//!     ▼
//! Arc<BrokerProvider>  (enum dispatch)
//!     ├── RabbitMq(RabbitMqBroker)
//!     └── InMemory(InMemoryBroker)
//! ```

pub mod provider;
pub mod providers;
pub mod routing;
pub mod traits;
pub mod types;

pub use provider::BrokerProvider;
pub use providers::{BrokerOperation, InMemoryBroker, PublishedMessage, RabbitMqBroker};
pub use routing::topic_matches;
pub use traits::{DeliveryStream, MessageBroker};
pub use types::{
    DeathRecord, ExchangeKind, ExchangeOptions, HeaderValue, Headers, MessageProperties,
    QueueOptions, RawDelivery,
};
