//! # RabbitMQ Broker
//!
//! `MessageBroker` over AMQP 0.9.1 using the `lapin` crate.
//!
//! One connection, one channel. lapin channels are internally synchronized, so the same
//! channel is shared by the consumer, the acknowledgment path and publishers.
//!
//! ## Usage
//!
//! ```ignore
//! use courier_bus::broker::providers::RabbitMqBroker;
//! use courier_bus::config::BusConfig;
//!
//! # async fn example(config: BusConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RabbitMqBroker::connect(&config).await?;
//! broker.assert_queue("orders_queue", &QueueOptions::durable()).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use crate::broker::traits::{DeliveryStream, MessageBroker};
use crate::broker::types::{
    ExchangeKind, ExchangeOptions, HeaderValue, Headers, MessageProperties, QueueOptions,
    RawDelivery,
};
use crate::config::BusConfig;
use crate::constants::headers;
use crate::error::{BusError, BusResult};

pub struct RabbitMqBroker {
    connection: Connection,
    channel: Channel,
    redacted_url: String,
}

impl std::fmt::Debug for RabbitMqBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqBroker")
            .field("url", &self.redacted_url)
            .field("channel_id", &self.channel.id())
            .finish()
    }
}

impl RabbitMqBroker {
    /// Connect, open the channel and apply the configured prefetch
    pub async fn connect(config: &BusConfig) -> BusResult<Self> {
        let connection_name = config
            .connection_name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", config.app_name, config.service_name));

        let connection = Connection::connect(
            &config.amqp_url(),
            ConnectionProperties::default().with_connection_name(connection_name.into()),
        )
        .await
        .map_err(|e| BusError::connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::channel(format!("RabbitMQ channel creation failed: {e}")))?;

        if config.prefetch_count > 0 {
            channel
                .basic_qos(config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| BusError::channel(format!("Failed to set QoS: {e}")))?;
        }

        info!(
            broker = %config.amqp_url_redacted(),
            prefetch = config.prefetch_count,
            "Connected to RabbitMQ"
        );

        Ok(Self {
            connection,
            channel,
            redacted_url: config.amqp_url_redacted(),
        })
    }
}

fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(dlx) = &options.dead_letter_exchange {
        args.insert(
            headers::DEAD_LETTER_EXCHANGE.into(),
            AMQPValue::LongString(dlx.as_str().into()),
        );
    }
    if let Some(routing_key) = &options.dead_letter_routing_key {
        args.insert(
            headers::DEAD_LETTER_ROUTING_KEY.into(),
            AMQPValue::LongString(routing_key.as_str().into()),
        );
    }
    if let Some(ttl) = options.message_ttl_ms {
        args.insert(
            headers::MESSAGE_TTL.into(),
            AMQPValue::LongLongInt(i64::from(ttl)),
        );
    }
    args
}

fn long_string_text(value: &LongString) -> String {
    String::from_utf8_lossy(value.as_bytes()).into_owned()
}

fn header_from_amqp(value: &AMQPValue) -> Option<HeaderValue> {
    let converted = match value {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::ShortUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongUInt(i) => HeaderValue::Int(i64::from(*i)),
        AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
        AMQPValue::Timestamp(t) => HeaderValue::Timestamp(*t),
        AMQPValue::ShortString(s) => HeaderValue::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => HeaderValue::String(long_string_text(s)),
        AMQPValue::FieldArray(items) => HeaderValue::Array(
            items
                .as_slice()
                .iter()
                .filter_map(header_from_amqp)
                .collect(),
        ),
        AMQPValue::FieldTable(table) => HeaderValue::Table(headers_from_table(table)),
        _ => return None,
    };
    Some(converted)
}

fn headers_from_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(k, v)| header_from_amqp(v).map(|v| (k.as_str().to_string(), v)))
        .collect()
}

fn header_to_amqp(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::String(s) => AMQPValue::LongString(s.as_str().into()),
        HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Timestamp(t) => AMQPValue::Timestamp(*t),
        HeaderValue::Array(items) => {
            let converted: Vec<AMQPValue> = items.iter().map(header_to_amqp).collect();
            AMQPValue::FieldArray(FieldArray::from(converted))
        }
        HeaderValue::Table(table) => AMQPValue::FieldTable(headers_to_table(table)),
    }
}

fn headers_to_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.as_str()), header_to_amqp(value));
    }
    table
}

fn properties_to_lapin(properties: MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default();
    if let Some(id) = properties.message_id {
        props = props.with_message_id(id.into());
    }
    if let Some(app_id) = properties.app_id {
        props = props.with_app_id(app_id.into());
    }
    if let Some(timestamp) = properties.timestamp {
        props = props.with_timestamp(timestamp);
    }
    if let Some(mode) = properties.delivery_mode {
        props = props.with_delivery_mode(mode);
    }
    if let Some(content_type) = properties.content_type {
        props = props.with_content_type(content_type.into());
    }
    if !properties.headers.is_empty() {
        props = props.with_headers(headers_to_table(&properties.headers));
    }
    props
}

fn properties_from_lapin(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        message_id: props.message_id().as_ref().map(|s| s.as_str().to_string()),
        app_id: props.app_id().as_ref().map(|s| s.as_str().to_string()),
        timestamp: *props.timestamp(),
        delivery_mode: *props.delivery_mode(),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        headers: props
            .headers()
            .as_ref()
            .map(headers_from_table)
            .unwrap_or_default(),
    }
}

fn delivery_from_lapin(delivery: lapin::message::Delivery) -> RawDelivery {
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: properties_from_lapin(&delivery.properties),
        body: delivery.data,
    }
}

#[async_trait]
impl MessageBroker for RabbitMqBroker {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BusResult<()> {
        self.channel
            .exchange_declare(
                name,
                lapin_exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::topology(name, format!("exchange declare failed: {e}")))?;
        debug!(exchange = %name, kind = %kind, "Exchange asserted");
        Ok(())
    }

    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> BusResult<()> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                queue_arguments(options),
            )
            .await
            .map_err(|e| BusError::topology(name, format!("queue declare failed: {e}")))?;
        debug!(
            queue = %name,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Queue asserted"
        );
        Ok(())
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> BusResult<()> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::topology(
                    format!("{source}->{destination}"),
                    format!("exchange bind failed: {e}"),
                )
            })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::topology(
                    format!("{exchange}->{queue}"),
                    format!("queue bind '{routing_key}' failed: {e}"),
                )
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::consume(queue, e.to_string()))?;

        let queue_name = queue.to_string();
        let stream = consumer.map(move |result| {
            result
                .map(delivery_from_lapin)
                .map_err(|e| BusError::consume(queue_name.clone(), e.to_string()))
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
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties_to_lapin(properties),
            )
            .await
            .map_err(|e| BusError::publish(exchange, e.to_string()))?;

        // Resolves immediately unless publisher confirms were enabled on the channel
        confirm
            .await
            .map_err(|e| BusError::publish(exchange, format!("publish confirmation failed: {e}")))?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> BusResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BusError::acknowledgement(delivery_tag, format!("ack failed: {e}")))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool, multiple: bool) -> BusResult<()> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { requeue, multiple })
            .await
            .map_err(|e| BusError::acknowledgement(delivery_tag, format!("nack failed: {e}")))
    }

    async fn close_channel(&self) -> BusResult<()> {
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| BusError::channel(format!("channel close failed: {e}")))
    }

    async fn close_connection(&self) -> BusResult<()> {
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| BusError::connection(format!("connection close failed: {e}")))
    }

    fn is_channel_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}
