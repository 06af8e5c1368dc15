//! AMQP (RabbitMQ) broker backend.
//!
//! Maps the capability traits onto lapin:
//! - one [`lapin::Connection`] per transport, link loss observed via `on_error`
//! - exchange destinations publish with `mandatory`, so unroutable messages
//!   come back as returns and fail the confirmation
//! - topic destinations publish to the default exchange, routing key = topic
//! - wire headers travel in the AMQP field table; content type, correlation id
//!   and timestamp are mirrored into the message properties, and the
//!   correlation id doubles as the message id

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use futures::future::{self, FutureExt};
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use lapin::publisher_confirm::Confirmation as AmqpConfirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    AckMode, BusError, Channel, ChannelOptions, Confirmation, Connector, Delivery, DeliveryAcker,
    DeliveryStream, Locator, Result, Transport,
};
use crate::config::{BrokerConfig, SubscriberConfig};
use crate::envelope::{
    Headers, WireMessage, CONTENT_TYPE_HEADER, CORRELATION_ID_HEADER, TIMESTAMP_HEADER,
};
use crate::routing::{Destination, DestinationFilter, ExchangeKind, QueueOptions, Source};

/// Field-table entry carrying the envelope key; AMQP has no native message key.
pub const KEY_HEADER: &str = "x-message-key";

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

// ============================================================================
// Connector
// ============================================================================

/// Opens lapin connections to one RabbitMQ virtual host.
pub struct AmqpConnector {
    config: BrokerConfig,
    consumer_tag: String,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig, subscriber: SubscriberConfig) -> Self {
        Self {
            config,
            consumer_tag: subscriber.consumer_tag,
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    fn address(&self) -> String {
        format!("amqp://{}{}", self.config.address(), self.config.namespace)
    }

    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let address = self.address();
        let connection = Connection::connect(&self.config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| connect_error(&address, e))?;

        let (down, down_rx) = watch::channel(false);
        {
            let address = address.clone();
            connection.on_error(move |err| {
                warn!(address = %address, error = %err, "AMQP connection error");
                down.send_replace(true);
            });
        }

        info!(address = %address, "AMQP connection established");
        Ok(Arc::new(AmqpTransport {
            connection,
            down: down_rx,
            consumer_tag: self.consumer_tag.clone(),
        }))
    }
}

/// Authentication and vhost refusals will not go away on retry.
fn connect_error(address: &str, err: lapin::Error) -> BusError {
    let fatal = match &err {
        lapin::Error::ProtocolError(amqp) => matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
                | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED)
        ),
        _ => false,
    };
    if fatal {
        BusError::fatal_connection(address, err)
    } else {
        BusError::connection(address, err)
    }
}

fn map_error(err: lapin::Error) -> BusError {
    match err {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            BusError::ConnectionLost
        }
        other => BusError::Channel(other.to_string()),
    }
}

// ============================================================================
// Transport
// ============================================================================

/// One RabbitMQ connection.
pub struct AmqpTransport {
    connection: Connection,
    down: watch::Receiver<bool>,
    consumer_tag: String,
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn open_channel(&self, options: ChannelOptions) -> Result<Box<dyn Channel>> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;
        if options.confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(map_error)?;
        }
        debug!(channel_id = channel.id(), confirm = options.confirm, "AMQP channel opened");
        Ok(Box::new(AmqpChannel {
            channel,
            options,
            consumer_tag: self.consumer_tag.clone(),
            published: AtomicU64::new(0),
            exchanges: Mutex::new(HashSet::new()),
        }))
    }

    async fn closed(&self) {
        let mut down = self.down.clone();
        let _ = down.wait_for(|down| *down).await;
    }

    async fn close(&self) -> Result<()> {
        let result = if self.connection.status().connected() {
            self.connection.close(200, "OK").await.map_err(map_error)
        } else {
            Ok(())
        };
        info!("AMQP connection closed");
        result
    }
}

// ============================================================================
// Channel
// ============================================================================

/// One AMQP channel.
pub struct AmqpChannel {
    channel: lapin::Channel,
    options: ChannelOptions,
    consumer_tag: String,
    /// Publisher-confirm sequence; the broker numbers confirms the same way.
    published: AtomicU64,
    /// Exchanges already declared on this channel.
    exchanges: Mutex<HashSet<String>>,
}

impl AmqpChannel {
    async fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) -> Result<()> {
        if exchange.is_empty() {
            return Ok(());
        }
        let known = self
            .exchanges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(exchange);
        if known {
            return Ok(());
        }

        self.channel
            .exchange_declare(
                exchange,
                exchange_kind(kind),
                exchange_options(&self.options),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        self.exchanges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(exchange.to_string());
        debug!(exchange = %exchange, kind = %kind, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        Ok(())
    }
}

fn exchange_options(options: &ChannelOptions) -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: options.durable,
        ..Default::default()
    }
}

/// Publish properties. The correlation id doubles as the message id, so
/// every publish attempt is identifiable to broker-side tooling.
fn message_properties(message: &WireMessage, options: &ChannelOptions) -> BasicProperties {
    let mode = if options.persistent {
        DELIVERY_MODE_PERSISTENT
    } else {
        DELIVERY_MODE_TRANSIENT
    };
    let mut properties = BasicProperties::default()
        .with_delivery_mode(mode)
        .with_headers(to_field_table(message));

    if let Some(Ok(content_type)) = message.headers.get_str(CONTENT_TYPE_HEADER) {
        properties = properties.with_content_type(ShortString::from(content_type));
    }
    if let Some(Ok(correlation_id)) = message.headers.get_str(CORRELATION_ID_HEADER) {
        properties = properties
            .with_correlation_id(ShortString::from(correlation_id))
            .with_message_id(ShortString::from(correlation_id));
    }
    if let Some(Ok(raw)) = message.headers.get_str(TIMESTAMP_HEADER) {
        if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
            properties = properties.with_timestamp(timestamp.timestamp().max(0) as u64);
        }
    }
    properties
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn send(&self, destination: &Destination, message: &WireMessage) -> Result<Confirmation> {
        let (exchange, routing_key) = match destination {
            Destination::Topic { topic, .. } => ("", topic.as_str()),
            Destination::Exchange {
                exchange,
                routing_key,
                kind,
            } => {
                self.declare_exchange(exchange, *kind).await?;
                (exchange.as_str(), routing_key.as_str())
            }
        };

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &message.payload,
                message_properties(message, &self.options),
            )
            .await
            .map_err(map_error)?;
        let tag = self.published.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.options.confirm {
            return Ok(future::ready(Ok(Locator::Unconfirmed)).boxed());
        }

        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        Ok(async move {
            match confirm.await.map_err(map_error)? {
                AmqpConfirmation::Ack(None) => Ok(Locator::DeliveryTag { tag }),
                AmqpConfirmation::Ack(Some(returned)) => Err(BusError::Unroutable(format!(
                    "{} {} - exchange '{}' routing key '{}'",
                    returned.reply_code,
                    returned.reply_text.as_str(),
                    exchange,
                    routing_key
                ))),
                AmqpConfirmation::Nack(_) => Err(BusError::Unroutable(format!(
                    "broker nacked publish to exchange '{}' routing key '{}'",
                    exchange, routing_key
                ))),
                AmqpConfirmation::NotRequested => Ok(Locator::Unconfirmed),
            }
        }
        .boxed())
    }

    async fn consume(&self, filter: &DestinationFilter, ack_mode: AckMode) -> Result<DeliveryStream> {
        match &filter.source {
            Source::Topics(topics) => {
                return Err(BusError::Channel(format!(
                    "topic subscription {:?} needs a log broker",
                    topics
                )));
            }
            Source::Queue => {
                self.declare_queue(&filter.consumer, filter.queue).await?;
            }
            Source::Exchange {
                exchange,
                kind,
                binding_keys,
            } => {
                self.declare_exchange(exchange, *kind).await?;
                self.declare_queue(&filter.consumer, filter.queue).await?;
                if !exchange.is_empty() {
                    for key in binding_keys {
                        self.channel
                            .queue_bind(
                                &filter.consumer,
                                exchange,
                                key,
                                QueueBindOptions::default(),
                                FieldTable::default(),
                            )
                            .await
                            .map_err(map_error)?;
                        info!(queue = %filter.consumer, exchange = %exchange, binding_key = %key, "Bound queue to exchange");
                    }
                }
            }
        }

        if ack_mode == AckMode::Manual && self.options.prefetch > 0 {
            self.channel
                .basic_qos(self.options.prefetch, BasicQosOptions::default())
                .await
                .map_err(map_error)?;
        }

        let consumer = self
            .channel
            .basic_consume(
                &filter.consumer,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: ack_mode == AckMode::Auto,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        // The consumer stream reports a broken channel once; end it there so
        // the subscriber resubscribes.
        let stream = consumer
            .take_while(|item| {
                if let Err(e) = item {
                    warn!(error = %e, "AMQP consumer failed");
                }
                future::ready(item.is_ok())
            })
            .map(move |item| item.map(|delivery| into_delivery(delivery, ack_mode)).map_err(map_error))
            .boxed();
        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "OK").await.map_err(map_error)?;
        }
        Ok(())
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

// ============================================================================
// Header mapping
// ============================================================================

fn to_field_table(message: &WireMessage) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in message.headers.iter() {
        table.insert(
            ShortString::from(name),
            AMQPValue::LongString(LongString::from(value.to_vec())),
        );
    }
    if let Some(key) = &message.key {
        table.insert(
            ShortString::from(KEY_HEADER),
            AMQPValue::LongString(LongString::from(key.as_bytes().to_vec())),
        );
    }
    table
}

/// Rebuild the wire form. String-valued field-table entries become headers;
/// content type and correlation id fall back to the message properties.
fn from_amqp(payload: Vec<u8>, properties: &BasicProperties) -> WireMessage {
    let mut headers = Headers::new();
    let mut key = None;

    if let Some(table) = properties.headers() {
        for (name, value) in table.inner() {
            let bytes = match value {
                AMQPValue::LongString(s) => Bytes::copy_from_slice(s.as_bytes()),
                AMQPValue::ShortString(s) => Bytes::copy_from_slice(s.as_str().as_bytes()),
                _ => continue,
            };
            if name.as_str() == KEY_HEADER {
                key = String::from_utf8(bytes.to_vec()).ok();
            } else {
                headers.insert(name.as_str(), bytes);
            }
        }
    }

    if !headers.contains(CONTENT_TYPE_HEADER) {
        if let Some(content_type) = properties.content_type() {
            headers.insert(CONTENT_TYPE_HEADER, content_type.as_str().to_string());
        }
    }
    if !headers.contains(CORRELATION_ID_HEADER) {
        if let Some(correlation_id) = properties.correlation_id() {
            headers.insert(CORRELATION_ID_HEADER, correlation_id.as_str().to_string());
        }
    }

    WireMessage {
        key,
        payload: Bytes::from(payload),
        headers,
    }
}

fn into_delivery(delivery: lapin::message::Delivery, ack_mode: AckMode) -> Delivery {
    let lapin::message::Delivery {
        delivery_tag,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    let acker: Box<dyn DeliveryAcker> = match ack_mode {
        AckMode::Auto => Box::new(NoAck),
        AckMode::Manual => Box::new(AmqpAcker(acker)),
    };
    Delivery::new(
        from_amqp(data, &properties),
        Locator::DeliveryTag { tag: delivery_tag },
        redelivered,
        acker,
    )
}

// ============================================================================
// Acknowledgment
// ============================================================================

struct AmqpAcker(Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    /// Rejected messages are dropped, not requeued.
    async fn reject(&self) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(map_error)
    }
}

/// Deliveries consumed with `no_ack` are settled by the broker on send.
struct NoAck;

#[async_trait]
impl DeliveryAcker for NoAck {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, TYPE_HEADER};

    fn order() -> WireMessage {
        Envelope::builder(r#"{"order-id":42}"#, "order-created")
            .key("42")
            .header("tenant", "acme")
            .build()
            .unwrap()
            .to_wire()
    }

    #[test]
    fn test_field_table_carries_headers_and_key() {
        let message = order();
        let table = to_field_table(&message);

        assert_eq!(table.inner().len(), message.headers.len() + 1);
        match table.inner().get(&ShortString::from(TYPE_HEADER)) {
            Some(AMQPValue::LongString(value)) => assert_eq!(value.as_bytes(), b"order-created"),
            other => panic!("unexpected type header {:?}", other),
        }
        match table.inner().get(&ShortString::from(KEY_HEADER)) {
            Some(AMQPValue::LongString(value)) => assert_eq!(value.as_bytes(), b"42"),
            other => panic!("unexpected key header {:?}", other),
        }
    }

    #[test]
    fn test_received_message_decodes_to_envelope() {
        let message = order();
        let properties = BasicProperties::default().with_headers(to_field_table(&message));

        let received = from_amqp(message.payload.to_vec(), &properties);

        assert_eq!(received.key.as_deref(), Some("42"));
        assert!(!received.headers.contains(KEY_HEADER));
        // The field table is sorted by name, so compare by value.
        let original = Envelope::from_wire(message).unwrap();
        let decoded = Envelope::from_wire(received).unwrap();
        assert_eq!(decoded.event_type(), original.event_type());
        assert_eq!(decoded.correlation_id(), original.correlation_id());
        assert_eq!(decoded.timestamp(), original.timestamp());
        assert_eq!(decoded.payload(), original.payload());
        assert_eq!(
            decoded.headers().get_str("tenant").unwrap().unwrap(),
            "acme"
        );
    }

    #[test]
    fn test_properties_fill_missing_headers() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(TYPE_HEADER),
            AMQPValue::ShortString(ShortString::from("order-created")),
        );
        table.insert(ShortString::from("retries"), AMQPValue::LongUInt(3));
        let properties = BasicProperties::default()
            .with_headers(table)
            .with_content_type(ShortString::from("application/json"))
            .with_correlation_id(ShortString::from("abc"));

        let received = from_amqp(b"{}".to_vec(), &properties);

        assert_eq!(
            received.headers.get_str(TYPE_HEADER).unwrap().unwrap(),
            "order-created"
        );
        assert_eq!(
            received.headers.get_str(CONTENT_TYPE_HEADER).unwrap().unwrap(),
            "application/json"
        );
        assert_eq!(
            received.headers.get_str(CORRELATION_ID_HEADER).unwrap().unwrap(),
            "abc"
        );
        assert!(!received.headers.contains("retries"));
        assert_eq!(received.key, None);
    }

    #[test]
    fn test_publish_properties_carry_message_id() {
        let message = order();
        let correlation_id = message
            .headers
            .get_str(CORRELATION_ID_HEADER)
            .unwrap()
            .unwrap()
            .to_string();

        let properties = message_properties(&message, &ChannelOptions::default());

        assert_eq!(
            properties.message_id().as_ref().map(ShortString::as_str),
            Some(correlation_id.as_str())
        );
        assert_eq!(
            properties.correlation_id().as_ref().map(ShortString::as_str),
            Some(correlation_id.as_str())
        );
        assert_eq!(*properties.delivery_mode(), Some(DELIVERY_MODE_PERSISTENT));
        assert!(properties.timestamp().is_some());

        let transient = message_properties(
            &message,
            &ChannelOptions {
                persistent: false,
                ..Default::default()
            },
        );
        assert_eq!(*transient.delivery_mode(), Some(DELIVERY_MODE_TRANSIENT));
    }

    #[test]
    fn test_exchange_durability_follows_channel_options() {
        assert!(exchange_options(&ChannelOptions::default()).durable);
        let transient = exchange_options(&ChannelOptions {
            durable: false,
            ..Default::default()
        });
        assert!(!transient.durable);
    }

    #[test]
    fn test_exchange_kind_mapping() {
        assert!(matches!(exchange_kind(ExchangeKind::Direct), lapin::ExchangeKind::Direct));
        assert!(matches!(exchange_kind(ExchangeKind::Topic), lapin::ExchangeKind::Topic));
        assert!(matches!(exchange_kind(ExchangeKind::Fanout), lapin::ExchangeKind::Fanout));
    }

    #[test]
    fn test_connector_address_includes_vhost() {
        let connector = AmqpConnector::new(BrokerConfig::default(), SubscriberConfig::default());
        assert_eq!(connector.address(), "amqp://localhost:5672/");
    }
}
