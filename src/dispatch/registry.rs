//! # Handler Registry
//!
//! The explicit `(topic, handler)` set an application supplies when it builds its bus.
//! Topics double as binding keys on the service exchange and as local match patterns,
//! with AMQP topic semantics (`*` one word, `#` zero or more words).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::broker::routing::topic_matches;
use crate::error::{BusError, BusResult};
use crate::messaging::{ApplicationMessage, OutcomeSender};

/// Message handler function type
///
/// Handlers receive the message and the sender used to report the outcome. A handler that
/// never reports leaves its delivery tracked and unacknowledged until disconnect.
pub type MessageHandler = Arc<
    dyn Fn(ApplicationMessage, OutcomeSender) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    subscriptions: Vec<(String, MessageHandler)>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("topics", &self.topics())
            .field("handler_count", &self.handler_count())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, topic: &str, handler: MessageHandler) -> BusResult<()> {
        if topic.is_empty() {
            return Err(BusError::configuration("handler topic cannot be empty"));
        }
        self.subscriptions.push((topic.to_string(), handler));
        Ok(())
    }

    /// Register an async closure
    ///
    /// ```rust
    /// use courier_bus::dispatch::HandlerRegistry;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut registry = HandlerRegistry::new();
    /// registry.on("invoice.created", |message, outcomes| async move {
    ///     let _ = outcomes.success(message.id, Vec::new());
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn on<F, Fut>(&mut self, topic: &str, handler: F) -> BusResult<()>
    where
        F: Fn(ApplicationMessage, OutcomeSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |message, outcomes| {
            Box::pin(handler(message, outcomes)) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        self.register(topic, handler)
    }

    /// Distinct registered topics, in registration order
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for (topic, _) in &self.subscriptions {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }
        topics
    }

    /// Handlers whose topic pattern matches a routing key
    pub fn matching(&self, routing_key: &str) -> Vec<MessageHandler> {
        self.subscriptions
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, routing_key))
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }

    pub fn handler_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
