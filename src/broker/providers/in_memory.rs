//! # In-Memory Broker
//!
//! In-process emulation of the AMQP features the bus relies on, for tests and local
//! development.
//!
//! ## Features
//!
//! - **Exchanges**: direct, topic and fanout routing, exchange-to-exchange bindings
//! - **Declare semantics**: identical redeclare succeeds, inequivalent redeclare fails
//! - **Dead-lettering**: `nack(requeue = false)` and TTL expiry route through the queue's
//!   dead-letter exchange and maintain the `x-death` header like RabbitMQ does
//! - **Message TTL**: expiry runs on the tokio clock, so paused-time tests can skip delays
//! - **Operation log**: every channel call is recorded for assertions
//!
//! Clones share state, so a test can keep one handle while the bus owns another.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::routing::topic_matches;
use crate::broker::traits::{DeliveryStream, MessageBroker};
use crate::broker::types::{
    DeathRecord, ExchangeKind, ExchangeOptions, HeaderValue, MessageProperties, QueueOptions,
    RawDelivery,
};
use crate::constants::headers;
use crate::error::{BusError, BusResult};

/// A channel call as observed by the broker
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerOperation {
    AssertExchange {
        name: String,
        kind: ExchangeKind,
    },
    AssertQueue {
        name: String,
        options: QueueOptions,
    },
    BindExchange {
        destination: String,
        source: String,
        routing_key: String,
    },
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Consume {
        queue: String,
        consumer_tag: String,
    },
    Publish(PublishedMessage),
    Ack {
        delivery_tag: u64,
    },
    Nack {
        delivery_tag: u64,
        requeue: bool,
        multiple: bool,
    },
    CloseChannel,
    CloseConnection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BindingTarget {
    Queue(String),
    Exchange(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Binding {
    source: String,
    target: BindingTarget,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    messages: VecDeque<StoredMessage>,
    consumer: Option<mpsc::UnboundedSender<RawDelivery>>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, (ExchangeKind, ExchangeOptions)>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: BTreeMap<u64, Unacked>,
    next_delivery_tag: u64,
    next_seq: u64,
    operations: Vec<BrokerOperation>,
    channel_closed: bool,
    connection_closed: bool,
    fail_publishes: bool,
    fail_closes: bool,
}

impl BrokerState {
    fn ensure_open(&self) -> BusResult<()> {
        if self.connection_closed {
            return Err(BusError::connection("connection is closed"));
        }
        if self.channel_closed {
            return Err(BusError::channel("channel is closed"));
        }
        Ok(())
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Queues a message published to `exchange` with `routing_key` ends up in
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default();
        }

        let mut queues = Vec::new();
        let mut seen_queues = HashSet::new();
        let mut visited = HashSet::new();
        let mut pending = vec![exchange.to_string()];

        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some((kind, _)) = self.exchanges.get(&current) else {
                continue;
            };
            for binding in self.bindings.iter().filter(|b| b.source == current) {
                let matched = match kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                    ExchangeKind::Headers => false,
                };
                if !matched {
                    continue;
                }
                match &binding.target {
                    BindingTarget::Queue(q) => {
                        if seen_queues.insert(q.clone()) {
                            queues.push(q.clone());
                        }
                    }
                    BindingTarget::Exchange(x) => pending.push(x.clone()),
                }
            }
        }
        queues
    }

    fn add_binding(&mut self, binding: Binding) {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    fn publishes(&self) -> impl Iterator<Item = &PublishedMessage> {
        self.operations.iter().filter_map(|op| match op {
            BrokerOperation::Publish(msg) => Some(msg),
            _ => None,
        })
    }
}

fn record_death(message: &mut StoredMessage, queue: &str, reason: &str) {
    let mut deaths = message.properties.deaths();
    let record = match deaths
        .iter()
        .position(|d| d.queue == queue && d.reason == reason)
    {
        Some(pos) => {
            let mut existing = deaths.remove(pos);
            existing.count += 1;
            existing
        }
        None => DeathRecord {
            queue: queue.to_string(),
            reason: reason.to_string(),
            exchange: message.exchange.clone(),
            count: 1,
            routing_keys: vec![message.routing_key.clone()],
        },
    };
    deaths.insert(0, record);

    let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
    message.properties.headers.insert(
        headers::DEATH.to_string(),
        HeaderValue::Array(
            deaths
                .iter()
                .map(|d| HeaderValue::Table(d.to_table(now)))
                .collect(),
        ),
    );
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every channel call made so far, in order
    pub fn operations(&self) -> Vec<BrokerOperation> {
        self.state.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.state.lock().operations.clear();
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().publishes().cloned().collect()
    }

    pub fn acked_tags(&self) -> Vec<u64> {
        self.state
            .lock()
            .operations
            .iter()
            .filter_map(|op| match op {
                BrokerOperation::Ack { delivery_tag } => Some(*delivery_tag),
                _ => None,
            })
            .collect()
    }

    pub fn nacked_tags(&self) -> Vec<u64> {
        self.state
            .lock()
            .operations
            .iter()
            .filter_map(|op| match op {
                BrokerOperation::Nack { delivery_tag, .. } => Some(*delivery_tag),
                _ => None,
            })
            .collect()
    }

    /// Messages ready in a queue (not yet delivered)
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Delivered but neither acked nor nacked
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state.lock().exchanges.get(name).map(|(kind, _)| *kind)
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|q| q.options.clone())
    }

    /// `(exchange, routing_key)` pairs bound to a queue
    pub fn queue_bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.target == BindingTarget::Queue(queue.to_string()))
            .map(|b| (b.source.clone(), b.routing_key.clone()))
            .collect()
    }

    /// `(source, routing_key)` pairs bound to an exchange
    pub fn exchange_bindings(&self, destination: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.target == BindingTarget::Exchange(destination.to_string()))
            .map(|b| (b.source.clone(), b.routing_key.clone()))
            .collect()
    }

    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings.len()
    }

    /// Make every following publish fail
    pub fn set_publish_failure(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    /// Make channel and connection closes fail, leaving both open
    pub fn set_close_failure(&self, fail: bool) {
        self.state.lock().fail_closes = fail;
    }

    fn enqueue(&self, state: &mut BrokerState, queue_name: &str, message: StoredMessage) {
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let seq = message.seq;
        queue.messages.push_back(message);

        if let Some(ttl_ms) = queue.options.message_ttl_ms {
            self.schedule_expiry(queue_name, seq, Duration::from_millis(u64::from(ttl_ms)));
        }
        self.deliver_ready(state, queue_name);
    }

    fn schedule_expiry(&self, queue_name: &str, seq: u64, ttl: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(queue = %queue_name, "No tokio runtime; message TTL will not be enforced");
            return;
        };
        let broker = self.clone();
        let queue_name = queue_name.to_string();
        runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            broker.expire(&queue_name, seq);
        });
    }

    fn expire(&self, queue_name: &str, seq: u64) {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let Some(pos) = queue.messages.iter().position(|m| m.seq == seq) else {
            // Already delivered
            return;
        };
        if let Some(message) = queue.messages.remove(pos) {
            debug!(queue = %queue_name, routing_key = %message.routing_key, "Message expired");
            self.dead_letter(&mut state, queue_name, message, "expired");
        }
    }

    fn deliver_ready(&self, state: &mut BrokerState, queue_name: &str) {
        loop {
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            let Some(consumer) = queue.consumer.clone() else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            let delivery_tag = state.next_delivery_tag + 1;
            let delivery = RawDelivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            if consumer.send(delivery).is_err() {
                if let Some(queue) = state.queues.get_mut(queue_name) {
                    queue.messages.push_front(message);
                    queue.consumer = None;
                }
                return;
            }

            state.next_delivery_tag = delivery_tag;
            state.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    message,
                },
            );
        }
    }

    fn dead_letter(
        &self,
        state: &mut BrokerState,
        queue_name: &str,
        mut message: StoredMessage,
        reason: &str,
    ) {
        let Some(options) = state.queues.get(queue_name).map(|q| q.options.clone()) else {
            return;
        };
        let Some(dlx) = options.dead_letter_exchange else {
            debug!(queue = %queue_name, "No dead-letter exchange; message discarded");
            return;
        };

        record_death(&mut message, queue_name, reason);
        let routing_key = options
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());
        message.exchange = dlx.clone();
        message.routing_key = routing_key;
        message.redelivered = false;

        for target in state.route(&dlx, &message.routing_key) {
            let mut copy = message.clone();
            copy.seq = state.next_seq();
            self.enqueue(state, &target, copy);
        }
    }

    fn requeue_unacked(&self, state: &mut BrokerState) {
        let unacked = std::mem::take(&mut state.unacked);
        for (_, entry) in unacked.into_iter().rev() {
            if let Some(queue) = state.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BusResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.operations.push(BrokerOperation::AssertExchange {
            name: name.to_string(),
            kind,
        });

        if name.is_empty() {
            return Err(BusError::topology(
                name,
                "ACCESS_REFUSED - the default exchange cannot be declared",
            ));
        }
        match state.exchanges.get(name) {
            Some((existing_kind, existing_options))
                if *existing_kind != kind || *existing_options != options =>
            {
                Err(BusError::topology(
                    name,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg for exchange '{name}': \
                         declared {kind} {options:?}, existing {existing_kind} {existing_options:?}"
                    ),
                ))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), (kind, options));
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> BusResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.operations.push(BrokerOperation::AssertQueue {
            name: name.to_string(),
            options: options.clone(),
        });

        match state.queues.get(name) {
            Some(existing) if existing.options != *options => Err(BusError::topology(
                name,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{name}': \
                     declared {options:?}, existing {:?}",
                    existing.options
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options: options.clone(),
                        messages: VecDeque::new(),
                        consumer: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> BusResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.operations.push(BrokerOperation::BindExchange {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
        });

        for name in [source, destination] {
            if !state.exchanges.contains_key(name) {
                return Err(BusError::topology(
                    name,
                    format!("NOT_FOUND - no exchange '{name}'"),
                ));
            }
        }
        state.add_binding(Binding {
            source: source.to_string(),
            target: BindingTarget::Exchange(destination.to_string()),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.operations.push(BrokerOperation::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });

        if !state.queues.contains_key(queue) {
            return Err(BusError::topology(
                queue,
                format!("NOT_FOUND - no queue '{queue}'"),
            ));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::topology(
                exchange,
                format!("NOT_FOUND - no exchange '{exchange}'"),
            ));
        }
        state.add_binding(Binding {
            source: exchange.to_string(),
            target: BindingTarget::Queue(queue.to_string()),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            state.operations.push(BrokerOperation::Consume {
                queue: queue.to_string(),
                consumer_tag: consumer_tag.to_string(),
            });

            let Some(queue_state) = state.queues.get_mut(queue) else {
                return Err(BusError::consume(queue, format!("NOT_FOUND - no queue '{queue}'")));
            };
            if queue_state
                .consumer
                .as_ref()
                .is_some_and(|existing| !existing.is_closed())
            {
                return Err(BusError::consume(queue, "queue already has a consumer"));
            }
            queue_state.consumer = Some(tx);
            self.deliver_ready(&mut state, queue);
        }

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        });
        Ok(Box::pin(stream))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> BusResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        if state.fail_publishes {
            return Err(BusError::publish(exchange, "injected publish failure"));
        }
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(BusError::publish(
                exchange,
                format!("NOT_FOUND - no exchange '{exchange}'"),
            ));
        }

        state
            .operations
            .push(BrokerOperation::Publish(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
                properties: properties.clone(),
            }));

        let targets = state.route(exchange, routing_key);
        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable; dropped");
        }
        for target in targets {
            let message = StoredMessage {
                seq: state.next_seq(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
                properties: properties.clone(),
                redelivered: false,
            };
            self.enqueue(&mut state, &target, message);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> BusResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.operations.push(BrokerOperation::Ack { delivery_tag });

        state.unacked.remove(&delivery_tag).map(|_| ()).ok_or_else(|| {
            BusError::acknowledgement(delivery_tag, "PRECONDITION_FAILED - unknown delivery tag")
        })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool, multiple: bool) -> BusResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.operations.push(BrokerOperation::Nack {
            delivery_tag,
            requeue,
            multiple,
        });

        let tags: Vec<u64> = if multiple {
            state.unacked.range(..=delivery_tag).map(|(t, _)| *t).collect()
        } else if state.unacked.contains_key(&delivery_tag) {
            vec![delivery_tag]
        } else {
            Vec::new()
        };
        if tags.is_empty() {
            return Err(BusError::acknowledgement(
                delivery_tag,
                "PRECONDITION_FAILED - unknown delivery tag",
            ));
        }

        for tag in tags {
            let Some(entry) = state.unacked.remove(&tag) else {
                continue;
            };
            if requeue {
                let mut message = entry.message;
                message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&entry.queue) {
                    queue.messages.push_front(message);
                }
                self.deliver_ready(&mut state, &entry.queue);
            } else {
                self.dead_letter(&mut state, &entry.queue, entry.message, "rejected");
            }
        }
        Ok(())
    }

    async fn close_channel(&self) -> BusResult<()> {
        let mut state = self.state.lock();
        if state.channel_closed || state.connection_closed {
            return Err(BusError::channel("channel already closed"));
        }
        if state.fail_closes {
            return Err(BusError::channel("injected close failure"));
        }
        state.operations.push(BrokerOperation::CloseChannel);
        state.channel_closed = true;
        for queue in state.queues.values_mut() {
            queue.consumer = None;
        }
        self.requeue_unacked(&mut state);
        Ok(())
    }

    async fn close_connection(&self) -> BusResult<()> {
        let mut state = self.state.lock();
        if state.connection_closed {
            return Err(BusError::connection("connection already closed"));
        }
        if state.fail_closes {
            return Err(BusError::connection("injected close failure"));
        }
        state.operations.push(BrokerOperation::CloseConnection);
        if !state.channel_closed {
            state.channel_closed = true;
            for queue in state.queues.values_mut() {
                queue.consumer = None;
            }
            self.requeue_unacked(&mut state);
        }
        state.connection_closed = true;
        Ok(())
    }

    fn is_channel_open(&self) -> bool {
        let state = self.state.lock();
        !state.channel_closed && !state.connection_closed
    }

    fn is_connected(&self) -> bool {
        !self.state.lock().connection_closed
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
