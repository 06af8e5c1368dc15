//! Broker capability layer.
//!
//! This module contains:
//! - `BusError`: error taxonomy shared by every component
//! - `Connector` / `Transport` / `Channel`: the minimal publish/consume
//!   capability each broker backend implements
//! - `Delivery` and `DeliveryAcker`: one received message and its ack handle
//! - Implementations: AMQP (RabbitMQ), Kafka, in-process memory broker

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::Deserialize;
use tracing::info;

use crate::config::{BrokerConfig, BrokerType, SubscriberConfig};
use crate::envelope::{DecodeError, WireMessage};
use crate::routing::{Destination, DestinationFilter};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
#[cfg(feature = "kafka")]
pub use kafka::KafkaConnector;
pub use memory::{MemoryBroker, MemoryConnector};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// Connecting failed. `fatal` marks authentication and namespace failures,
    /// which are never retried.
    #[error("Connection to {address} failed: {reason}")]
    Connection {
        address: String,
        reason: String,
        fatal: bool,
    },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Unroutable: {0}")]
    Unroutable(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection lost before acknowledgment")]
    ConnectionLost,

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    Closed,
}

impl BusError {
    /// Transient connection failure, eligible for backoff retry.
    pub fn connection(address: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Connection {
            address: address.into(),
            reason: reason.to_string(),
            fatal: false,
        }
    }

    /// Authentication or namespace failure.
    pub fn fatal_connection(address: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Connection {
            address: address.into(),
            reason: reason.to_string(),
            fatal: true,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { fatal, .. } => !fatal,
            Self::Channel(_) | Self::Timeout(_) | Self::ConnectionLost => true,
            _ => false,
        }
    }
}

// ============================================================================
// Delivery model
// ============================================================================

/// Where the broker physically recorded a publish.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// Log broker write position.
    Offset {
        topic: String,
        partition: i32,
        offset: i64,
    },
    /// Routing broker publisher-confirm sequence number.
    DeliveryTag { tag: u64 },
    /// Publisher confirms disabled; the broker did not report a position.
    Unconfirmed,
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset {
                topic,
                partition,
                offset,
            } => write!(f, "{} [[{}]] @{}", topic, partition, offset),
            Self::DeliveryTag { tag } => write!(f, "delivery-tag {}", tag),
            Self::Unconfirmed => f.write_str("unconfirmed"),
        }
    }
}

/// Acknowledgment policy of a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Consumed on receipt, before the handler runs (at-most-once).
    Auto,
    /// Acknowledged after the handler succeeds (at-least-once).
    #[default]
    Manual,
}

/// Options applied when a channel is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Wait for broker confirmation of each publish.
    pub confirm: bool,
    /// Maximum unacknowledged deliveries in flight to a consumer.
    pub prefetch: u16,
    /// Ask the broker to persist published messages.
    pub persistent: bool,
    /// Declare exchanges that survive a broker restart.
    pub durable: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            confirm: true,
            prefetch: 16,
            persistent: true,
            durable: true,
        }
    }
}

/// Broker confirmation of one publish.
pub type Confirmation = BoxFuture<'static, Result<Locator>>;

/// Lazy sequence of deliveries for one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Acknowledges or discards one delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Mark the delivery consumed.
    async fn ack(&self) -> Result<()>;

    /// Discard the delivery without redelivery (poison messages).
    async fn reject(&self) -> Result<()>;
}

/// One message received from the broker.
pub struct Delivery {
    pub message: WireMessage,
    pub locator: Locator,
    pub redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        message: WireMessage,
        locator: Locator,
        redelivered: bool,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            message,
            locator,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self) -> Result<()> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("locator", &self.locator)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Establishes transports to one broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Broker address for diagnostics.
    fn address(&self) -> String;

    /// Open a new transport.
    ///
    /// Returns `BusError::Connection` with `fatal: true` on authentication or
    /// namespace failures.
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}

/// One live connection to the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a logical channel on this connection.
    async fn open_channel(&self, options: ChannelOptions) -> Result<Box<dyn Channel>>;

    /// Resolves once the link is gone, for any reason.
    async fn closed(&self);

    /// Close the connection and every channel derived from it.
    async fn close(&self) -> Result<()>;
}

/// Logical channel bound to a transport.
///
/// Implementations need not serialize concurrent `send` calls; callers do.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Hand a message to the broker. Completes once the message is written;
    /// the returned confirmation resolves when the broker acknowledges it.
    async fn send(&self, destination: &Destination, message: &WireMessage)
        -> Result<Confirmation>;

    /// Register a consumer and return its delivery stream.
    async fn consume(&self, filter: &DestinationFilter, ack_mode: AckMode)
        -> Result<DeliveryStream>;

    /// Release the channel.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a broker connector based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - AMQP: `--features amqp`
/// - Kafka: `--features kafka`
///
/// The memory broker lives inside this process, so a connector built here only
/// reaches publishers and subscribers sharing the returned instance.
pub fn init_connector(
    broker: &BrokerConfig,
    subscriber: &SubscriberConfig,
) -> std::result::Result<Arc<dyn Connector>, BusError> {
    match broker.broker_type {
        BrokerType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let connector = AmqpConnector::new(broker.clone(), subscriber.clone());
                info!(broker_type = "amqp", address = %connector.address(), "Connector initialized");
                Ok(Arc::new(connector))
            }

            #[cfg(not(feature = "amqp"))]
            {
                let _ = subscriber;
                Err(BusError::Config(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        BrokerType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let connector = KafkaConnector::new(broker.clone(), subscriber.clone());
                info!(broker_type = "kafka", address = %connector.address(), "Connector initialized");
                Ok(Arc::new(connector))
            }

            #[cfg(not(feature = "kafka"))]
            {
                let _ = subscriber;
                Err(BusError::Config(
                    "Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                        .to_string(),
                ))
            }
        }
        BrokerType::Memory => {
            let connector = MemoryBroker::new().connector_for(broker);
            info!(broker_type = "memory", "Connector initialized");
            Ok(Arc::new(connector))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BusError::connection("localhost:5672", "refused").is_retryable());
        assert!(!BusError::fatal_connection("localhost:5672", "ACCESS_REFUSED").is_retryable());
        assert!(BusError::ConnectionLost.is_retryable());
        assert!(BusError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!BusError::Unroutable("no route".to_string()).is_retryable());
        assert!(!BusError::Decode(DecodeError::MissingHeader("type")).is_retryable());
    }

    #[test]
    fn test_locator_display() {
        let offset = Locator::Offset {
            topic: "order-topic".to_string(),
            partition: 0,
            offset: 12,
        };
        assert_eq!(offset.to_string(), "order-topic [[0]] @12");
        assert_eq!(Locator::DeliveryTag { tag: 3 }.to_string(), "delivery-tag 3");
    }

    #[test]
    fn test_ack_mode_default_is_manual() {
        assert_eq!(AckMode::default(), AckMode::Manual);
    }

    #[test]
    fn test_init_memory_connector() {
        let broker = BrokerConfig {
            broker_type: BrokerType::Memory,
            ..Default::default()
        };
        let connector = init_connector(&broker, &SubscriberConfig::default()).unwrap();
        assert!(connector.address().starts_with("memory://"));
    }
}
