//! # Message Bus
//!
//! The façade applications hold. One bus owns one broker connection and channel, its
//! handler registry, its in-flight table and its outcome channel; nothing is
//! process-global, so several buses can coexist in one process.
//!
//! ## Lifecycle
//!
//! ```text
//! connect / with_broker ──▶ start ──▶ (consume, dispatch, resolve) ──▶ disconnect
//!                            │
//!                            ├── provision topology
//!                            ├── bind every registered topic
//!                            ├── spawn inbound dispatcher (consume loop)
//!                            └── spawn outcome resolver
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerProvider, DeliveryStream, RabbitMqBroker};
use crate::config::BusConfig;
use crate::dispatch::{DispatchStatsSnapshot, HandlerRegistry, InFlightTable, InboundDispatcher};
use crate::error::{BusError, BusResult};
use crate::messaging::{OutboundMessage, OutcomeSender, OutcomeSignal};
use crate::publisher::OutboundPublisher;
use crate::resolver::{OutcomeResolver, Resolution, RetryPolicy};
use crate::topology::{TopologyDescriptor, TopologyProvisioner};

#[derive(Debug)]
pub struct MessageBus {
    config: BusConfig,
    topology: TopologyDescriptor,
    broker: Arc<BrokerProvider>,
    registry: Arc<HandlerRegistry>,
    in_flight: InFlightTable,
    publisher: OutboundPublisher,
    outcomes: OutcomeSender,
    pending_signals: Mutex<Option<mpsc::UnboundedReceiver<OutcomeSignal>>>,
    dispatcher: InboundDispatcher,
    resolver: OutcomeResolver,
    consumer_tag: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBus {
    /// Connect to RabbitMQ as configured
    pub async fn connect(config: BusConfig, registry: HandlerRegistry) -> BusResult<Self> {
        config.validate()?;
        let broker = RabbitMqBroker::connect(&config).await?;
        Ok(Self::with_broker(config, registry, broker))
    }

    /// Build a bus over an already-connected broker
    pub fn with_broker(
        config: BusConfig,
        registry: HandlerRegistry,
        broker: impl Into<BrokerProvider>,
    ) -> Self {
        let broker = Arc::new(broker.into());
        let registry = Arc::new(registry);
        let topology = config.topology();
        let in_flight = InFlightTable::new();
        let (outcomes, signals) = OutcomeSender::channel();

        let publisher = OutboundPublisher::new(
            Arc::clone(&broker),
            config.app_name.clone(),
            topology.main_bus_exchange.clone(),
        );
        let dispatcher = InboundDispatcher::new(
            Arc::clone(&broker),
            Arc::clone(&registry),
            in_flight.clone(),
            outcomes.clone(),
            config.app_name.clone(),
            topology.primary_queue.clone(),
        );
        let resolver = OutcomeResolver::new(
            Arc::clone(&broker),
            in_flight.clone(),
            publisher.clone(),
            RetryPolicy::new(config.max_retries),
        );
        let consumer_tag = format!("{}.{}.{}", config.app_name, config.service_name, Uuid::new_v4());

        Self {
            config,
            topology,
            broker,
            registry,
            in_flight,
            publisher,
            outcomes,
            pending_signals: Mutex::new(Some(signals)),
            dispatcher,
            resolver,
            consumer_tag,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Provision, bind registered topics and begin consuming
    pub async fn start(&self) -> BusResult<()> {
        let Some(signals) = self.pending_signals.lock().take() else {
            return Err(BusError::configuration("bus already started"));
        };

        let deliveries = match self.open_consumer().await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                // Keep the bus startable
                *self.pending_signals.lock() = Some(signals);
                return Err(e);
            }
        };

        let resolver = tokio::spawn(self.resolver.clone().run(signals));
        let dispatcher = tokio::spawn(self.dispatcher.clone().run(deliveries));
        self.tasks.lock().extend([resolver, dispatcher]);

        info!(
            app_name = %self.config.app_name,
            service_name = %self.config.service_name,
            queue = %self.topology.primary_queue,
            consumer_tag = %self.consumer_tag,
            topics = ?self.registry.topics(),
            provider = self.broker.provider_name(),
            "Message bus started"
        );
        Ok(())
    }

    async fn open_consumer(&self) -> BusResult<DeliveryStream> {
        self.provision().await?;
        for topic in self.registry.topics() {
            self.subscribe(&topic).await?;
        }
        self.broker
            .consume(&self.topology.primary_queue, &self.consumer_tag)
            .await
    }

    /// Declare this service's exchanges, queues and bindings
    pub async fn provision(&self) -> BusResult<()> {
        TopologyProvisioner::provision(&self.broker, &self.topology).await
    }

    pub async fn publish(
        &self,
        message: &OutboundMessage,
        alternative_exchange: Option<&str>,
    ) -> BusResult<()> {
        self.publisher.publish(message, alternative_exchange).await
    }

    /// Route `topic` from the service exchange into the primary queue
    pub async fn subscribe(&self, topic: &str) -> BusResult<()> {
        self.broker
            .bind_queue(&self.topology.primary_queue, &self.topology.service_exchange, topic)
            .await?;
        debug!(
            topic = %topic,
            queue = %self.topology.primary_queue,
            exchange = %self.topology.service_exchange,
            "Topic subscribed"
        );
        Ok(())
    }

    /// Subscribe each topic in order; `None` or an empty slice does nothing
    pub async fn subscribe_all(&self, topics: Option<&[&str]>) -> BusResult<()> {
        for topic in topics.unwrap_or_default() {
            self.subscribe(topic).await?;
        }
        Ok(())
    }

    /// Sender for reporting processing outcomes
    pub fn outcomes(&self) -> OutcomeSender {
        self.outcomes.clone()
    }

    /// Resolutions made by the running resolver
    pub fn resolutions(&self) -> broadcast::Receiver<Resolution> {
        self.resolver.subscribe()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn dispatch_stats(&self) -> DispatchStatsSnapshot {
        self.dispatcher.stats()
    }

    pub fn topology(&self) -> &TopologyDescriptor {
        &self.topology
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<BrokerProvider> {
        &self.broker
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Stop the loops, then close the channel and the connection
    ///
    /// A channel or connection that is already closed is not an error. Deliveries still in
    /// flight are returned to the queue by the broker.
    pub async fn disconnect(&self) -> BusResult<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let in_flight = self.in_flight.len();
        if in_flight > 0 {
            warn!(
                in_flight = in_flight,
                "Disconnecting with unresolved deliveries; the broker will redeliver them"
            );
        }

        if self.broker.is_channel_open() {
            if let Err(e) = self.broker.close_channel().await {
                if self.broker.is_channel_open() {
                    return Err(e);
                }
                debug!(error = %e, "Channel closed concurrently");
            }
        } else {
            debug!("Channel already closed");
        }

        if self.broker.is_connected() {
            if let Err(e) = self.broker.close_connection().await {
                if self.broker.is_connected() {
                    return Err(e);
                }
                debug!(error = %e, "Connection closed concurrently");
            }
        } else {
            debug!("Connection already closed");
        }

        info!(
            service_name = %self.config.service_name,
            stats = ?self.dispatcher.stats(),
            "Message bus disconnected"
        );
        Ok(())
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
