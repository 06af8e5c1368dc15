//! Kafka broker backend.
//!
//! One transport owns a `FutureProducer`; each channel may add a
//! `StreamConsumer` for its subscription. Destinations map as follows:
//! - topic destinations publish to the topic, keyed by the partition key
//! - exchange destinations publish to a topic named after the exchange,
//!   keyed by the routing key
//!
//! Offsets are committed explicitly: on receipt in auto mode, on
//! acknowledgment in manual mode. Link loss is reported by librdkafka through
//! the client context (`AllBrokersDown`).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, FutureExt};
use futures::stream::{self, StreamExt};
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers as _, Message as _, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AckMode, BusError, Channel, ChannelOptions, Confirmation, Connector, Delivery, DeliveryAcker,
    DeliveryStream, Locator, Result, Transport,
};
use crate::config::{BrokerConfig, SubscriberConfig};
use crate::envelope::{Headers, WireMessage};
use crate::routing::{Destination, DestinationFilter, Source};

/// Upper bound for librdkafka to deliver one record.
const MESSAGE_TIMEOUT_MS: &str = "5000";
/// Flush budget when a transport closes.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Client context
// ============================================================================

/// Client context shared by the producer and consumers of one transport.
///
/// Flags the link as down once librdkafka reports every broker unreachable.
pub struct LinkContext {
    address: String,
    down: Arc<watch::Sender<bool>>,
}

impl ClientContext for LinkContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(address = %self.address, error = %error, reason = %reason, "Kafka client error");
        if error.rdkafka_error_code() == Some(RDKafkaErrorCode::AllBrokersDown) {
            self.down.send_replace(true);
        }
    }
}

impl ConsumerContext for LinkContext {}

// ============================================================================
// Connector
// ============================================================================

/// Connects to a Kafka cluster.
#[derive(Clone)]
pub struct KafkaConnector {
    config: BrokerConfig,
    subscriber: SubscriberConfig,
}

impl KafkaConnector {
    pub fn new(config: BrokerConfig, subscriber: SubscriberConfig) -> Self {
        Self { config, subscriber }
    }

    /// Settings shared by producers and consumers.
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.config.address());
        apply_security_config(&self.config, &mut config);
        config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        config.set("message.timeout.ms", MESSAGE_TIMEOUT_MS);
        config.set("acks", "all");
        config.set("enable.idempotence", "true");
        config
    }

    fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut config = self.client_config();
        config.set("group.id", group);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", &self.subscriber.auto_offset_reset);
        config
    }
}

/// Apply security settings to a ClientConfig.
fn apply_security_config(broker: &BrokerConfig, config: &mut ClientConfig) {
    if let Some(ref protocol) = broker.security_protocol {
        config.set("security.protocol", protocol);
    }

    if let Some(ref mechanism) = broker.sasl_mechanism {
        config.set("sasl.mechanism", mechanism);
        config.set("sasl.username", &broker.username);
        config.set("sasl.password", &broker.password);
    }

    if let Some(ref ca_location) = broker.ssl_ca_location {
        config.set("ssl.ca.location", ca_location);
    }
}

/// Authentication failures will not go away on retry.
fn connect_error(address: &str, err: KafkaError) -> BusError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed,
        ) => BusError::fatal_connection(address, err),
        _ => BusError::connection(address, err),
    }
}

fn delivery_error(err: KafkaError) -> BusError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::UnknownTopic
            | RDKafkaErrorCode::UnknownPartition
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => BusError::Unroutable(err.to_string()),
        Some(RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure) => {
            BusError::ConnectionLost
        }
        _ => BusError::Channel(err.to_string()),
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    fn address(&self) -> String {
        format!("kafka://{}", self.config.address())
    }

    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let address = self.address();
        let (down, down_rx) = watch::channel(false);
        let down = Arc::new(down);

        let producer: FutureProducer<LinkContext> = self
            .producer_config()
            .create_with_context(LinkContext {
                address: address.clone(),
                down: Arc::clone(&down),
            })
            .map_err(|e| connect_error(&address, e))?;

        // librdkafka connects lazily; a metadata round trip proves the link.
        let metadata_producer = producer.clone();
        let timeout = self.config.connect_timeout();
        let (brokers, topics) = tokio::task::spawn_blocking(move || {
            metadata_producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| (metadata.brokers().len(), metadata.topics().len()))
        })
        .await
        .map_err(|e| BusError::connection(&address, e))?
        .map_err(|e| connect_error(&address, e))?;

        info!(address = %address, brokers, topics, "Connected to Kafka");
        Ok(Arc::new(KafkaTransport {
            connector: self.clone(),
            address,
            producer,
            down,
            down_rx,
        }))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// One Kafka client session.
pub struct KafkaTransport {
    connector: KafkaConnector,
    address: String,
    producer: FutureProducer<LinkContext>,
    down: Arc<watch::Sender<bool>>,
    down_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn open_channel(&self, options: ChannelOptions) -> Result<Box<dyn Channel>> {
        if *self.down_rx.borrow() {
            return Err(BusError::ConnectionLost);
        }
        Ok(Box::new(KafkaChannel {
            connector: self.connector.clone(),
            address: self.address.clone(),
            producer: self.producer.clone(),
            down: Arc::clone(&self.down),
            options,
            closed: CancellationToken::new(),
            consumer: Mutex::new(None),
        }))
    }

    async fn closed(&self) {
        let mut down = self.down_rx.clone();
        let _ = down.wait_for(|down| *down).await;
    }

    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT)).await;
        self.down.send_replace(true);
        info!(address = %self.address, "Kafka client closed");
        match flushed {
            Ok(result) => result.map_err(delivery_error),
            Err(e) => Err(BusError::Channel(format!("flush task failed: {}", e))),
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

type KafkaConsumer = StreamConsumer<LinkContext>;

/// Producer handle plus at most one consumer.
pub struct KafkaChannel {
    connector: KafkaConnector,
    address: String,
    producer: FutureProducer<LinkContext>,
    down: Arc<watch::Sender<bool>>,
    options: ChannelOptions,
    closed: CancellationToken,
    consumer: Mutex<Option<Arc<KafkaConsumer>>>,
}

#[async_trait]
impl Channel for KafkaChannel {
    async fn send(&self, destination: &Destination, message: &WireMessage) -> Result<Confirmation> {
        if self.closed.is_cancelled() {
            return Err(BusError::Channel("channel closed".to_string()));
        }
        let (topic, key) = match destination {
            Destination::Topic {
                topic,
                partition_key,
            } => (topic.as_str(), partition_key.as_deref()),
            Destination::Exchange {
                exchange,
                routing_key,
                ..
            } => (exchange.as_str(), Some(routing_key.as_str())),
        };

        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic)
            .payload(message.payload.as_ref())
            .headers(to_kafka_headers(&message.headers));
        if let Some(key) = key {
            record = record.key(key);
        }

        // Enqueued synchronously, so records leave in the order they were sent.
        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| delivery_error(e))?;

        if !self.options.confirm {
            return Ok(future::ready(Ok(Locator::Unconfirmed)).boxed());
        }

        let topic = topic.to_string();
        Ok(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => Ok(Locator::Offset {
                    topic,
                    partition,
                    offset,
                }),
                Ok(Err((e, _))) => Err(delivery_error(e)),
                Err(_) => Err(BusError::ConnectionLost),
            }
        }
        .boxed())
    }

    async fn consume(&self, filter: &DestinationFilter, ack_mode: AckMode) -> Result<DeliveryStream> {
        let topics = match &filter.source {
            Source::Topics(topics) => topics,
            other => {
                return Err(BusError::Channel(format!(
                    "{:?} needs a routing broker",
                    other
                )));
            }
        };

        let consumer: KafkaConsumer = self
            .connector
            .consumer_config(&filter.consumer)
            .create_with_context(LinkContext {
                address: self.address.clone(),
                down: Arc::clone(&self.down),
            })
            .map_err(|e| BusError::Channel(e.to_string()))?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BusError::Channel(format!("Failed to subscribe to topics: {}", e)))?;
        info!(topics = ?topics, group = %filter.consumer, "Subscribed to Kafka topics");

        let consumer = Arc::new(consumer);
        *self.consumer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&consumer));

        let feed = Feed {
            consumer,
            ack_mode,
            closed: self.closed.clone(),
            down: self.down.subscribe(),
        };
        Ok(stream::unfold(feed, |feed| async move {
            let item = feed.next().await?;
            Some((item, feed))
        })
        .boxed())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = consumer {
            consumer.unsubscribe();
        }
        Ok(())
    }
}

// ============================================================================
// Consumption
// ============================================================================

struct Feed {
    consumer: Arc<KafkaConsumer>,
    ack_mode: AckMode,
    closed: CancellationToken,
    down: watch::Receiver<bool>,
}

impl Feed {
    /// Next record; `None` once the channel closes or the link drops.
    async fn next(&self) -> Option<Result<Delivery>> {
        let mut down = self.down.clone();
        let received = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return None,
            _ = down.wait_for(|down| *down) => return None,
            received = self.consumer.recv() => received.map(|message| message.detach()),
        };

        let message = match received {
            Ok(message) => message,
            Err(e) => return Some(Err(BusError::Channel(e.to_string()))),
        };
        let acker = OffsetAcker {
            consumer: Arc::clone(&self.consumer),
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        };
        let locator = Locator::Offset {
            topic: acker.topic.clone(),
            partition: acker.partition,
            offset: acker.offset,
        };
        debug!(locator = %locator, "Kafka record received");

        let acker: Box<dyn DeliveryAcker> = match self.ack_mode {
            AckMode::Auto => {
                if let Err(e) = acker.commit() {
                    warn!(locator = %locator, error = %e, "Failed to commit offset");
                }
                Box::new(Committed)
            }
            AckMode::Manual => Box::new(acker),
        };
        Some(Ok(Delivery::new(from_kafka(&message), locator, false, acker)))
    }
}

/// Commits `offset + 1` for the record's partition.
struct OffsetAcker {
    consumer: Arc<KafkaConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl OffsetAcker {
    fn commit(&self) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .map_err(|e| BusError::Channel(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| BusError::Channel(format!("Failed to commit offset: {}", e)))
    }
}

#[async_trait]
impl DeliveryAcker for OffsetAcker {
    async fn ack(&self) -> Result<()> {
        self.commit()
    }

    /// A log has no discard; skipping the record means committing past it.
    async fn reject(&self) -> Result<()> {
        self.commit()
    }
}

/// Offset already committed on receipt.
struct Committed;

#[async_trait]
impl DeliveryAcker for Committed {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Header mapping
// ============================================================================

fn to_kafka_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |kafka, (name, value)| {
            kafka.insert(Header {
                key: name,
                value: Some(&value[..]),
            })
        })
}

fn from_kafka(message: &OwnedMessage) -> WireMessage {
    let mut headers = Headers::new();
    if let Some(kafka) = message.headers() {
        for header in kafka.iter() {
            let value = header.value.map(Bytes::copy_from_slice).unwrap_or_default();
            headers.insert(header.key, value);
        }
    }
    WireMessage {
        key: message
            .key()
            .and_then(|key| std::str::from_utf8(key).ok())
            .map(str::to_string),
        payload: message.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
        headers,
    }
}

#[cfg(test)]
mod tests;
