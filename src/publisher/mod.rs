//! Publisher: envelope in, broker acknowledgment out.
//!
//! A publish resolves the envelope's destination, hands the wire form to a
//! channel leased from the [`ConnectionManager`] and waits for the broker's
//! confirmation. The channel sits behind a mutex for the send step only, so
//! sequential publishes reach the broker in submission order while
//! confirmations are awaited concurrently.
//!
//! Publishes are never retried implicitly. [`Publisher::publish_with_retry`]
//! is the explicit, caller-requested variant.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bus::{BusError, ChannelOptions, Confirmation, Locator, Result};
use crate::config::Config;
use crate::connection::{ChannelLease, ConnectionManager};
use crate::envelope::{Envelope, WireMessage};
use crate::routing::{Destination, RoutingPolicy};
use crate::utils::retry::publish_backoff;

/// Lifecycle of one publish.
#[derive(Debug, Clone)]
pub enum DeliveryStatus {
    Pending,
    Acknowledged(Locator),
    Failed(BusError),
}

/// What happened to an envelope handed to the publisher.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    /// Envelope of the last attempt.
    pub envelope: Envelope,
    pub destination: Destination,
    pub status: DeliveryStatus,
    pub attempts: u32,
}

impl DeliveryRecord {
    fn new(envelope: Envelope, destination: Destination) -> Self {
        Self {
            envelope,
            destination,
            status: DeliveryStatus::Pending,
            attempts: 0,
        }
    }

    /// Terminal outcome; a record still pending reports `Closed`.
    pub fn outcome(&self) -> DeliveryOutcome {
        match &self.status {
            DeliveryStatus::Acknowledged(locator) => DeliveryOutcome::Acknowledged(locator.clone()),
            DeliveryStatus::Failed(error) => DeliveryOutcome::Failed(error.clone()),
            DeliveryStatus::Pending => DeliveryOutcome::Failed(BusError::Closed),
        }
    }
}

/// Terminal result of a publish.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Acknowledged(Locator),
    Failed(BusError),
}

impl DeliveryOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged(_))
    }

    pub fn into_result(self) -> Result<Locator> {
        match self {
            Self::Acknowledged(locator) => Ok(locator),
            Self::Failed(error) => Err(error),
        }
    }
}

/// Publisher tuning.
#[derive(Debug, Clone, Copy)]
pub struct PublisherSettings {
    pub options: ChannelOptions,
    /// Maximum wait for one broker confirmation.
    pub timeout: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            options: ChannelOptions::default(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl PublisherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            options: config.channel_options(),
            timeout: config.publisher.timeout(),
        }
    }
}

/// Explicit retry policy for [`Publisher::publish_with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: usize,
    pub backoff: ExponentialBuilder,
    /// Keep the correlation id across attempts, so consumers can
    /// deduplicate. Otherwise every attempt gets a fresh one.
    pub idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: publish_backoff(),
            idempotent: false,
        }
    }
}

/// Publishes envelopes through a shared connection.
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    routing: RoutingPolicy,
    settings: PublisherSettings,
    lease: Mutex<Option<ChannelLease>>,
}

impl Publisher {
    pub fn new(
        manager: Arc<ConnectionManager>,
        routing: RoutingPolicy,
        settings: PublisherSettings,
    ) -> Self {
        Self {
            manager,
            routing,
            settings,
            lease: Mutex::new(None),
        }
    }

    pub fn routing(&self) -> &RoutingPolicy {
        &self.routing
    }

    /// Publish once and report the terminal outcome.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(event_type = %envelope.event_type(), correlation_id = %envelope.correlation_id()))]
    pub async fn publish(&self, envelope: &Envelope) -> DeliveryOutcome {
        self.deliver(envelope).await.outcome()
    }

    /// Publish once and return the full delivery record.
    pub async fn deliver(&self, envelope: &Envelope) -> DeliveryRecord {
        let destination = self.routing.resolve(envelope);
        let mut record = DeliveryRecord::new(envelope.clone(), destination);
        record.attempts = 1;

        let result = self.attempt(&record.destination, envelope).await;
        self.settle(&mut record, result);
        record
    }

    /// Publish with bounded, backed-off retries of transient failures.
    ///
    /// Each retry reissues the envelope with a fresh correlation id unless
    /// the policy is idempotent. Non-retryable failures (unroutable,
    /// invalid) end the loop at once.
    #[tracing::instrument(name = "bus.publish_with_retry", skip_all, fields(event_type = %envelope.event_type()))]
    pub async fn publish_with_retry(&self, envelope: &Envelope, policy: RetryPolicy) -> DeliveryRecord {
        let destination = self.routing.resolve(envelope);
        let mut record = DeliveryRecord::new(envelope.clone(), destination);
        let mut delays = policy
            .backoff
            .with_max_times(policy.max_attempts.saturating_sub(1))
            .build();

        loop {
            record.attempts += 1;
            let result = self.attempt(&record.destination, &record.envelope).await;
            let error = match result {
                Ok(locator) => {
                    self.settle(&mut record, Ok(locator));
                    return record;
                }
                Err(e) => e,
            };

            let delay = match delays.next() {
                Some(delay) if error.is_retryable() => delay,
                _ => {
                    self.settle(&mut record, Err(error));
                    return record;
                }
            };
            warn!(
                attempt = record.attempts,
                error = %error,
                retry_in = ?delay,
                "Publish failed, retrying"
            );
            tokio::time::sleep(delay).await;
            // Give a reconnect in progress a chance before spending an attempt.
            let _ = self.manager.wait_connected(self.settings.timeout).await;
            if !policy.idempotent {
                record.envelope = record.envelope.reissue();
            }
        }
    }

    fn settle(&self, record: &mut DeliveryRecord, result: Result<Locator>) {
        match result {
            Ok(locator) => {
                debug!(
                    destination = %record.destination,
                    correlation_id = %record.envelope.correlation_id(),
                    locator = %locator,
                    "Delivered"
                );
                record.status = DeliveryStatus::Acknowledged(locator);
            }
            Err(error) => {
                warn!(
                    destination = %record.destination,
                    correlation_id = %record.envelope.correlation_id(),
                    error = %error,
                    "Delivery failed"
                );
                record.status = DeliveryStatus::Failed(error);
            }
        }
    }

    async fn attempt(&self, destination: &Destination, envelope: &Envelope) -> Result<Locator> {
        let message = envelope.to_wire();
        let (confirmation, generation) = self.send(destination, &message).await?;
        self.confirm(confirmation, generation).await
    }

    /// Hand the message to the broker while holding the channel.
    async fn send(
        &self,
        destination: &Destination,
        message: &WireMessage,
    ) -> Result<(Confirmation, u64)> {
        let mut guard = self.lease.lock().await;

        let current = self.manager.generation();
        if guard.as_ref().map_or(true, |lease| lease.generation != current) {
            if let Some(stale) = guard.take() {
                let _ = stale.channel.close().await;
            }
            let lease = self.manager.open_channel(self.settings.options).await?;
            debug!(generation = lease.generation, "Publisher channel leased");
            *guard = Some(lease);
        }
        let Some(lease) = guard.as_ref() else {
            return Err(BusError::Closed);
        };

        let generation = lease.generation;
        let sent = lease.channel.send(destination, message).await;
        match sent {
            Ok(confirmation) => Ok((confirmation, generation)),
            Err(e) => {
                if matches!(e, BusError::ConnectionLost | BusError::Channel(_)) {
                    guard.take();
                }
                Err(e)
            }
        }
    }

    /// Wait for the broker's confirmation, bounded by the link and the timeout.
    async fn confirm(&self, confirmation: Confirmation, generation: u64) -> Result<Locator> {
        let wait = async {
            tokio::select! {
                biased;
                result = confirmation => result,
                _ = self.manager.link_lost(generation) => Err(BusError::ConnectionLost),
            }
        };
        match tokio::time::timeout(self.settings.timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(self.settings.timeout)),
        }
    }

    /// Release the leased channel.
    pub async fn close(&self) -> Result<()> {
        let lease = self.lease.lock().await.take();
        match lease {
            Some(lease) => lease.channel.close().await,
            None => Ok(()),
        }
    }
}
