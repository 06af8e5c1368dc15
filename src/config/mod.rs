//! Application configuration.
//!
//! Aggregates broker, destination, publisher, subscriber, routing and
//! producer settings into a single Config struct that can be loaded from
//! YAML files or environment variables.

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

use crate::bus::{AckMode, ChannelOptions};
use crate::routing::{
    DestinationFilter, ExchangeKind, QueueOptions, RoutingConfig, RoutingPolicy,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTWIRE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTWIRE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENTWIRE_LOG";

/// Default AMQP port.
pub const DEFAULT_AMQP_PORT: u16 = 5672;
/// Default Kafka port.
pub const DEFAULT_KAFKA_PORT: u16 = 9092;

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Broker backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// RabbitMQ (routing broker).
    #[default]
    Amqp,
    /// Kafka (log broker).
    Kafka,
    /// In-process simulated broker.
    Memory,
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    pub host: String,
    /// Defaults to the standard port of the broker type.
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    /// Virtual host (AMQP); ignored by Kafka.
    pub namespace: String,
    pub connect_timeout_ms: u64,
    /// Attempts per connect round before giving up.
    pub connect_attempts: usize,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// Pause between reconnect rounds after a link drop.
    pub reconnect_interval_ms: u64,
    /// Kafka `security.protocol` (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// Kafka SASL mechanism; when set, `username`/`password` are sent as SASL credentials.
    pub sasl_mechanism: Option<String>,
    pub ssl_ca_location: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::Amqp,
            host: "localhost".to_string(),
            port: None,
            username: "guest".to_string(),
            password: "guest".to_string(),
            namespace: "/".to_string(),
            connect_timeout_ms: 10_000,
            connect_attempts: 5,
            backoff_min_ms: 100,
            backoff_max_ms: 5_000,
            reconnect_interval_ms: 5_000,
            security_protocol: None,
            sasl_mechanism: None,
            ssl_ca_location: None,
        }
    }
}

impl BrokerConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.broker_type {
            BrokerType::Kafka => DEFAULT_KAFKA_PORT,
            BrokerType::Amqp | BrokerType::Memory => DEFAULT_AMQP_PORT,
        })
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    /// AMQP URI with credentials and percent-encoded vhost.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}/{}",
            self.username,
            self.password,
            self.address(),
            self.namespace.replace('%', "%25").replace('/', "%2f")
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Backoff between connect attempts of one round.
    pub fn backoff(&self) -> ExponentialBuilder {
        crate::utils::retry::connection_backoff()
            .with_min_delay(Duration::from_millis(self.backoff_min_ms))
            .with_max_delay(Duration::from_millis(self.backoff_max_ms))
            .with_max_times(self.connect_attempts.saturating_sub(1))
    }
}

/// Where the demo binaries publish and consume.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Queue name (AMQP) or topic name (Kafka).
    pub name: String,
    /// Exchange to bind to; empty means the default exchange.
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    /// Binding key; defaults to `name`.
    pub routing_key: Option<String>,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            name: "demo.queue".to_string(),
            exchange: String::new(),
            exchange_kind: ExchangeKind::Topic,
            routing_key: None,
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

impl DestinationConfig {
    pub fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.name)
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
        }
    }
}

/// Publisher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Wait for publisher confirms.
    pub confirm: bool,
    /// Maximum wait for one confirmation.
    pub timeout_ms: u64,
    pub persistent: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            confirm: true,
            timeout_ms: 5_000,
            persistent: true,
        }
    }
}

impl PublisherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Subscriber settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    pub ack_mode: AckMode,
    /// Kafka consumer group.
    pub group_id: String,
    /// Kafka `auto.offset.reset` for groups without a committed offset.
    pub auto_offset_reset: String,
    /// AMQP basic.qos prefetch count.
    pub prefetch: u16,
    pub consumer_tag: String,
    /// Pause before a failed topic record is read again.
    pub redelivery_delay_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::Manual,
            group_id: "eventwire-consumer-group".to_string(),
            auto_offset_reset: "earliest".to_string(),
            prefetch: 16,
            consumer_tag: "eventwire-consumer".to_string(),
            redelivery_delay_ms: 1_000,
        }
    }
}

impl SubscriberConfig {
    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

/// Demo producer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// JSON array of orders to publish.
    pub data_file: String,
    /// Delay between two publishes.
    pub interval_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            data_file: "data.json".to_string(),
            interval_ms: 1_000,
        }
    }
}

impl ProducerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub destination: DestinationConfig,
    pub publisher: PublisherConfig,
    pub subscriber: SubscriberConfig,
    pub routing: RoutingConfig,
    pub producer: ProducerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.host must not be empty".to_string()));
        }
        if self.broker.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "broker.connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.broker.backoff_min_ms > self.broker.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "broker.backoff_min_ms exceeds broker.backoff_max_ms".to_string(),
            ));
        }
        if self.destination.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "destination.name must not be empty".to_string(),
            ));
        }
        if !matches!(
            self.subscriber.auto_offset_reset.as_str(),
            "earliest" | "latest" | "error"
        ) {
            return Err(ConfigError::Invalid(format!(
                "subscriber.auto_offset_reset '{}' is not one of earliest, latest, error",
                self.subscriber.auto_offset_reset
            )));
        }
        RoutingPolicy::from_config(&self.routing)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    /// Compile the routing policy.
    pub fn routing_policy(&self) -> crate::bus::Result<RoutingPolicy> {
        RoutingPolicy::from_config(&self.routing)
    }

    /// Options for channels opened by publishers and subscribers.
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            confirm: self.publisher.confirm,
            prefetch: self.subscriber.prefetch,
            persistent: self.publisher.persistent,
            durable: self.destination.durable,
        }
    }

    /// Filter the consumer subscribes with.
    ///
    /// With an exchange configured, a queue named `destination.name` is bound
    /// to it. Otherwise Kafka and the memory broker consume the topic
    /// `destination.name` as group `subscriber.group_id`, and AMQP consumes
    /// the queue directly.
    pub fn destination_filter(&self) -> DestinationFilter {
        let destination = &self.destination;
        let filter = if !destination.exchange.is_empty() {
            DestinationFilter::exchange(
                destination.exchange.clone(),
                destination.exchange_kind,
                destination.routing_key(),
                destination.name.clone(),
            )
        } else {
            match self.broker.broker_type {
                BrokerType::Amqp => DestinationFilter::queue(destination.name.clone()),
                BrokerType::Kafka | BrokerType::Memory => DestinationFilter::topics(
                    [destination.name.clone()],
                    self.subscriber.group_id.clone(),
                ),
            }
        };
        filter.with_queue_options(destination.queue_options())
    }
}
