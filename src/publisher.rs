//! # Outbound Publisher
//!
//! Publishes messages onto the bus. Every message is persistent and stamped with this
//! application's id, the publish time and its own identifier, so receiving services can
//! filter, track and trace it. Parent lineage travels in the `x-parent-id` header.
//!
//! There is no retry here: a failed publish surfaces to the caller as
//! [`BusError::Publish`](crate::error::BusError::Publish).

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::broker::{BrokerProvider, HeaderValue, MessageProperties};
use crate::constants::{headers, PERSISTENT_DELIVERY_MODE};
use crate::error::{BusError, BusResult};
use crate::messaging::OutboundMessage;

#[derive(Debug, Clone)]
pub struct OutboundPublisher {
    broker: Arc<BrokerProvider>,
    app_name: String,
    default_exchange: String,
}

impl OutboundPublisher {
    pub fn new(
        broker: Arc<BrokerProvider>,
        app_name: impl Into<String>,
        default_exchange: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            app_name: app_name.into(),
            default_exchange: default_exchange.into(),
        }
    }

    /// Publish to `alternative_exchange` if given, else the main bus; routing key is the topic
    pub async fn publish(
        &self,
        message: &OutboundMessage,
        alternative_exchange: Option<&str>,
    ) -> BusResult<()> {
        let exchange = alternative_exchange.unwrap_or(&self.default_exchange);
        let properties = self.properties_for(message);

        self.broker
            .publish(exchange, &message.topic, &message.body, properties)
            .await?;

        debug!(
            message_id = %message.id,
            topic = %message.topic,
            exchange = %exchange,
            parent_id = ?message.parent_id,
            "Message published"
        );
        Ok(())
    }

    /// Publish each message in order, attempting all of them
    ///
    /// Returns how many succeeded and the first failure, if any.
    pub async fn publish_all(
        &self,
        messages: &[OutboundMessage],
    ) -> (usize, Option<BusError>) {
        let mut published = 0;
        let mut first_error = None;

        for message in messages {
            match self.publish(message, None).await {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        topic = %message.topic,
                        error = %e,
                        "Failed to publish resulting message"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        (published, first_error)
    }

    fn properties_for(&self, message: &OutboundMessage) -> MessageProperties {
        let mut properties = MessageProperties {
            message_id: Some(message.id.clone()),
            app_id: Some(self.app_name.clone()),
            timestamp: u64::try_from(Utc::now().timestamp()).ok(),
            delivery_mode: Some(PERSISTENT_DELIVERY_MODE),
            content_type: message.content_type.clone(),
            ..Default::default()
        };
        if let Some(parent_id) = &message.parent_id {
            properties.headers.insert(
                headers::PARENT_ID.to_string(),
                HeaderValue::String(parent_id.clone()),
            );
        }
        properties
    }
}
