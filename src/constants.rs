//! # Bus Constants
//!
//! Names and defaults shared by every deployed copy of a service. The naming scheme must
//! stay bit-exact: existing deployments have queues and exchanges declared under these names.

/// Shared fanout exchange every service publishes broadcast traffic to
pub const MAIN_BUS_EXCHANGE: &str = "main_bus";

/// Retry limit applied when an error outcome carries no explicit limit
pub const DEFAULT_MAX_RETRIES: u32 = 60;

/// Default delay a failed message waits in the retry queue
pub const DEFAULT_RETRY_DELAY_SECONDS: u64 = 5;

/// AMQP persistent delivery mode
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub mod naming {
    pub const PRIMARY_QUEUE_SUFFIX: &str = "_queue";
    pub const RETRY_QUEUE_SUFFIX: &str = "_queue_retry";
    pub const DEAD_LETTER_EXCHANGE_SUFFIX: &str = "_dlx";

    pub fn primary_queue(service_name: &str) -> String {
        format!("{service_name}{PRIMARY_QUEUE_SUFFIX}")
    }

    pub fn retry_queue(service_name: &str) -> String {
        format!("{service_name}{RETRY_QUEUE_SUFFIX}")
    }

    pub fn dead_letter_exchange(service_name: &str) -> String {
        format!("{service_name}{DEAD_LETTER_EXCHANGE_SUFFIX}")
    }

    pub fn service_exchange(service_name: &str) -> String {
        service_name.to_string()
    }
}

pub mod headers {
    /// Lineage header naming the message that caused this one
    pub const PARENT_ID: &str = "x-parent-id";
    /// Dead-letter history maintained by the broker
    pub const DEATH: &str = "x-death";
    pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
    pub const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
    pub const MESSAGE_TTL: &str = "x-message-ttl";
}
