//! Subscriber loop: receive, decode, dispatch, acknowledge.
//!
//! Every subscription owns its channel and runs as its own task:
//!
//! ```text
//! Idle -> Subscribed -> Receiving <-> Dispatching -> Cancelling -> Stopped
//! ```
//!
//! Cancellation is cooperative. The loop only observes it while waiting for
//! the next delivery, so a handler always runs to completion and its
//! acknowledgment is sent before the loop stops.
//!
//! Log brokers acknowledge by committing an offset, which settles every
//! earlier record of the partition too. A manual-ack topic subscription whose
//! handler fails therefore stops reading, waits `redelivery_delay` and
//! resubscribes from the committed offset, so the failed record comes back
//! before anything after it is acknowledged.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{AckMode, BusError, ChannelOptions, Delivery, DeliveryStream, Result};
use crate::config::Config;
use crate::connection::{ChannelLease, ConnectionManager};
use crate::envelope::Envelope;
use crate::routing::{DestinationFilter, Source};
use crate::utils::retry::resubscribe_backoff;

/// Handler for envelopes received by a subscription.
pub trait EnvelopeHandler: Send + Sync {
    /// Process one envelope. An error leaves a manually acknowledged
    /// delivery unacknowledged.
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<()>>;
}

struct FnHandler<F>(F);

impl<F, Fut> EnvelopeHandler for FnHandler<F>
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<()>> {
        (self.0)(envelope).boxed()
    }
}

/// Wrap a closure as an [`EnvelopeHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EnvelopeHandler>
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not registered with the broker (initially, and while resubscribing).
    Idle,
    Subscribed,
    Receiving,
    Dispatching,
    Cancelling,
    Stopped,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Subscribed => "subscribed",
            Self::Receiving => "receiving",
            Self::Dispatching => "dispatching",
            Self::Cancelling => "cancelling",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Handler succeeded.
    Success,
    /// Handler failed; a manual-ack delivery stays unacknowledged.
    HandlerFailed,
    /// Message could not be decoded and was discarded.
    DecodeError,
}

/// Subscriber tuning.
#[derive(Debug, Clone, Copy)]
pub struct SubscriberSettings {
    pub options: ChannelOptions,
    pub ack_mode: AckMode,
    /// Backoff between resubscribe attempts after the stream ended.
    pub resubscribe: ExponentialBuilder,
    /// How long one resubscribe attempt waits for the connection.
    pub reconnect_wait: Duration,
    /// Pause before a topic subscription rewinds to a failed record.
    pub redelivery_delay: Duration,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            options: ChannelOptions::default(),
            ack_mode: AckMode::Manual,
            resubscribe: resubscribe_backoff(),
            reconnect_wait: Duration::from_secs(30),
            redelivery_delay: Duration::from_secs(1),
        }
    }
}

impl SubscriberSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            options: config.channel_options(),
            ack_mode: config.subscriber.ack_mode,
            redelivery_delay: config.subscriber.redelivery_delay(),
            ..Default::default()
        }
    }
}

/// Creates subscriptions on a shared connection.
pub struct Subscriber {
    manager: Arc<ConnectionManager>,
    settings: SubscriberSettings,
}

impl Subscriber {
    pub fn new(manager: Arc<ConnectionManager>, settings: SubscriberSettings) -> Self {
        Self { manager, settings }
    }

    /// Register a consumer for `filter` and start dispatching to `handler`.
    ///
    /// Registration errors (not connected, channel errors) are returned here;
    /// afterwards the subscription runs until cancelled or the manager closes.
    pub async fn subscribe(
        &self,
        filter: DestinationFilter,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<SubscriptionHandle> {
        let (state, state_rx) = watch::channel(SubscriptionState::Idle);
        let token = self.manager.child_token();
        let subscription = Subscription {
            manager: Arc::clone(&self.manager),
            settings: self.settings,
            filter,
            handler,
            token: token.clone(),
            state,
        };

        let (lease, stream) = subscription.register().await?;
        subscription.set(SubscriptionState::Subscribed);
        info!(
            consumer = %subscription.filter.consumer,
            ack_mode = ?subscription.settings.ack_mode,
            "Subscribed"
        );

        let task = tokio::spawn(subscription.run(lease, stream));
        Ok(SubscriptionHandle {
            token,
            state: state_rx,
            task,
        })
    }
}

/// Control handle of a running subscription.
pub struct SubscriptionHandle {
    token: CancellationToken,
    state: watch::Receiver<SubscriptionState>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Request cancellation without waiting.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait until the loop has stopped and closed its channel.
    pub async fn stop(self) -> Result<()> {
        self.token.cancel();
        self.join().await
    }

    /// Wait for the loop to end on its own (manager closed).
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| BusError::Handler(format!("subscription task failed: {}", e)))
    }
}

struct Subscription {
    manager: Arc<ConnectionManager>,
    settings: SubscriberSettings,
    filter: DestinationFilter,
    handler: Arc<dyn EnvelopeHandler>,
    token: CancellationToken,
    state: watch::Sender<SubscriptionState>,
}

impl Subscription {
    fn set(&self, state: SubscriptionState) {
        self.state.send_replace(state);
    }

    async fn register(&self) -> Result<(ChannelLease, DeliveryStream)> {
        let lease = self.manager.open_channel(self.settings.options).await?;
        match lease
            .channel
            .consume(&self.filter, self.settings.ack_mode)
            .await
        {
            Ok(stream) => Ok((lease, stream)),
            Err(e) => {
                let _ = lease.channel.close().await;
                Err(e)
            }
        }
    }

    async fn run(self, mut lease: ChannelLease, mut stream: DeliveryStream) {
        loop {
            self.set(SubscriptionState::Receiving);
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let result = self.dispatch(delivery).await;
                    if result == DispatchResult::HandlerFailed && self.rewinds_on_failure() {
                        let _ = lease.channel.close().await;
                        warn!(
                            consumer = %self.filter.consumer,
                            delay = ?self.settings.redelivery_delay,
                            "Rewinding to the committed offset"
                        );
                        tokio::select! {
                            biased;
                            _ = self.token.cancelled() => break,
                            _ = tokio::time::sleep(self.settings.redelivery_delay) => {}
                        }
                        match self.resubscribe().await {
                            Some((fresh, fresh_stream)) => {
                                lease = fresh;
                                stream = fresh_stream;
                            }
                            None => break,
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(consumer = %self.filter.consumer, error = %e, "Delivery stream error");
                }
                None => {
                    let _ = lease.channel.close().await;
                    warn!(consumer = %self.filter.consumer, "Delivery stream ended, resubscribing");
                    match self.resubscribe().await {
                        Some((fresh, fresh_stream)) => {
                            lease = fresh;
                            stream = fresh_stream;
                        }
                        None => break,
                    }
                }
            }
        }

        self.set(SubscriptionState::Cancelling);
        if let Err(e) = lease.channel.close().await {
            debug!(error = %e, "Channel already closed");
        }
        self.set(SubscriptionState::Stopped);
        info!(consumer = %self.filter.consumer, "Subscription stopped");
    }

    /// Re-register after the delivery stream ended. `None` once cancelled or
    /// when the connection is gone for good.
    async fn resubscribe(&self) -> Option<(ChannelLease, DeliveryStream)> {
        self.set(SubscriptionState::Idle);

        loop {
            let attempt = move || async move {
                self.manager
                    .wait_connected(self.settings.reconnect_wait)
                    .await?;
                self.register().await
            };
            let retry = attempt
                .retry(self.settings.resubscribe)
                .when(BusError::is_retryable)
                .notify(|err: &BusError, dur: Duration| {
                    warn!(consumer = %self.filter.consumer, error = %err, delay = ?dur, "Resubscribe failed, retrying");
                });
            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                result = retry => result,
            };

            match result {
                Ok(pair) => {
                    self.set(SubscriptionState::Subscribed);
                    info!(consumer = %self.filter.consumer, generation = pair.0.generation, "Resubscribed");
                    return Some(pair);
                }
                Err(BusError::Closed) => return None,
                Err(e) if !e.is_retryable() => {
                    error!(consumer = %self.filter.consumer, error = %e, "Cannot resubscribe, stopping");
                    return None;
                }
                Err(e) => {
                    warn!(consumer = %self.filter.consumer, error = %e, "Resubscribe attempts exhausted, starting over");
                }
            }
        }
    }

    /// Whether a failed handler must hold back the rest of the partition.
    fn rewinds_on_failure(&self) -> bool {
        self.settings.ack_mode == AckMode::Manual
            && matches!(self.filter.source, Source::Topics(_))
    }

    async fn dispatch(&self, delivery: Delivery) -> DispatchResult {
        self.set(SubscriptionState::Dispatching);
        let locator = delivery.locator.clone();

        let envelope = match Envelope::from_wire(delivery.message.clone()) {
            Ok(envelope) => Arc::new(envelope),
            Err(e) => {
                warn!(locator = %locator, error = %e, "Discarding undecodable message");
                if let Err(e) = delivery.reject().await {
                    error!(locator = %locator, error = %e, "Failed to reject message");
                }
                return DispatchResult::DecodeError;
            }
        };

        if self.settings.ack_mode == AckMode::Auto {
            if let Err(e) = delivery.ack().await {
                error!(locator = %locator, error = %e, "Failed to acknowledge message");
            }
        }

        debug!(
            event_type = %envelope.event_type(),
            correlation_id = %envelope.correlation_id(),
            locator = %locator,
            redelivered = delivery.redelivered,
            "Dispatching"
        );

        match self.handler.handle(Arc::clone(&envelope)).await {
            Ok(()) => {
                if self.settings.ack_mode == AckMode::Manual {
                    if let Err(e) = delivery.ack().await {
                        error!(locator = %locator, error = %e, "Failed to acknowledge message");
                    }
                }
                DispatchResult::Success
            }
            Err(e) => {
                error!(
                    event_type = %envelope.event_type(),
                    correlation_id = %envelope.correlation_id(),
                    locator = %locator,
                    error = %e,
                    "Handler failed"
                );
                DispatchResult::HandlerFailed
            }
        }
    }
}
