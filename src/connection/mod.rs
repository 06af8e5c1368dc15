//! Broker connection manager.
//!
//! Owns the single live transport to the broker and its lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closing -> Closed
//!                     ^             |
//!                     +-------------+  (link failure)
//! ```
//!
//! Publishers and subscriptions lease channels from the manager. Each
//! successful (re)connect bumps the connection generation, so holders of a
//! lease can tell whether it still belongs to the live transport.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, Channel, ChannelOptions, Connector, Result, Transport};
use crate::config::BrokerConfig;
use crate::utils::retry::connection_backoff;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State plus the generation of the installed transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    /// 0 before the first successful connect.
    pub generation: u64,
}

/// Connect and reconnect tuning.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Backoff between attempts of one connect round.
    pub backoff: ExponentialBuilder,
    /// Pause between reconnect rounds after a link drop.
    pub reconnect_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for ConnectionSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            backoff: config.backoff(),
            reconnect_interval: config.reconnect_interval(),
        }
    }
}

impl ConnectionSettings {
    /// Tight timings for tests against the in-process broker.
    pub fn fast() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            backoff: connection_backoff()
                .with_min_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(10))
                .with_max_times(4),
            reconnect_interval: Duration::from_millis(10),
        }
    }
}

/// A channel together with the connection generation it was opened on.
pub struct ChannelLease {
    pub channel: Box<dyn Channel>,
    pub generation: u64,
}

struct Inner {
    transport: Option<Arc<dyn Transport>>,
    generation: u64,
}

/// Owns one logical connection to the broker.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    inner: Mutex<Inner>,
    status: watch::Sender<LinkStatus>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Arc<Self> {
        let (status, _) = watch::channel(LinkStatus {
            state: ConnectionState::Disconnected,
            generation: 0,
        });
        Arc::new(Self {
            connector,
            settings,
            inner: Mutex::new(Inner {
                transport: None,
                generation: 0,
            }),
            status,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn from_config(connector: Arc<dyn Connector>, config: &BrokerConfig) -> Arc<Self> {
        Self::new(connector, ConnectionSettings::from(config))
    }

    /// Broker address for diagnostics.
    pub fn address(&self) -> String {
        self.connector.address()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn generation(&self) -> u64 {
        self.status.borrow().generation
    }

    /// Observe state transitions.
    pub fn watch_link(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    /// Token cancelled when the manager closes; subscriptions derive theirs from it.
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_status(&self, inner: &Inner, state: ConnectionState) {
        self.status.send_replace(LinkStatus {
            state,
            generation: inner.generation,
        });
    }

    /// Establish the connection.
    ///
    /// Transient failures are retried with backoff, each attempt bounded by
    /// the connect timeout. Authentication and namespace failures return
    /// immediately. Returns `Ok` at once when already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let previous = {
            let inner = self.lock();
            let previous = self.state();
            if previous == ConnectionState::Disconnected {
                self.publish_status(&inner, ConnectionState::Connecting);
            }
            previous
        };

        match previous {
            ConnectionState::Disconnected => {}
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting => {
                // Someone else is connecting; wait for the outcome.
                let mut link = self.watch_link();
                let status = match link
                    .wait_for(|s| s.state != ConnectionState::Connecting)
                    .await
                {
                    Ok(status) => *status,
                    Err(_) => return Err(BusError::Closed),
                };
                return match status.state {
                    ConnectionState::Connected => Ok(()),
                    ConnectionState::Disconnected => Err(BusError::connection(
                        self.address(),
                        "concurrent connect attempt failed",
                    )),
                    _ => Err(BusError::Closed),
                };
            }
            ConnectionState::Closing | ConnectionState::Closed => return Err(BusError::Closed),
        }

        info!(address = %self.address(), "Connecting to broker");
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(BusError::Closed),
            result = self.establish() => result,
        };

        match result {
            Ok(transport) => {
                let generation = self.install(Arc::clone(&transport)).await?;
                info!(address = %self.address(), generation, "Connected to broker");
                tokio::spawn(Arc::clone(self).monitor(transport));
                Ok(())
            }
            Err(e) => {
                {
                    let inner = self.lock();
                    if self.state() == ConnectionState::Connecting {
                        self.publish_status(&inner, ConnectionState::Disconnected);
                    }
                }
                error!(address = %self.address(), error = %e, "Failed to connect to broker");
                Err(e)
            }
        }
    }

    /// One connect round: attempts with backoff until success, a fatal error
    /// or the attempt budget runs out.
    async fn establish(&self) -> Result<Arc<dyn Transport>> {
        let connector = Arc::clone(&self.connector);
        let timeout = self.settings.connect_timeout;
        let address = self.address();

        let attempt = || {
            let connector = Arc::clone(&connector);
            async move {
                match tokio::time::timeout(timeout, connector.connect()).await {
                    Ok(result) => result,
                    Err(_) => Err(BusError::Timeout(timeout)),
                }
            }
        };

        attempt
            .retry(self.settings.backoff)
            .when(BusError::is_retryable)
            .notify(|err: &BusError, dur: Duration| {
                warn!(
                    address = %address,
                    error = %err,
                    retry_in = ?dur,
                    "Broker connect attempt failed, retrying"
                );
            })
            .await
    }

    /// Make a transport the live one. Closes it instead when the manager is
    /// shutting down.
    async fn install(&self, transport: Arc<dyn Transport>) -> Result<u64> {
        let installed = {
            let mut inner = self.lock();
            if self.state() == ConnectionState::Connecting {
                inner.transport = Some(Arc::clone(&transport));
                inner.generation += 1;
                self.publish_status(&inner, ConnectionState::Connected);
                Some(inner.generation)
            } else {
                None
            }
        };
        match installed {
            Some(generation) => Ok(generation),
            None => {
                let _ = transport.close().await;
                Err(BusError::Closed)
            }
        }
    }

    /// Watch the live transport and reconnect whenever it drops.
    async fn monitor(self: Arc<Self>, mut transport: Arc<dyn Transport>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = transport.closed() => {}
            }
            if self.shutdown.is_cancelled() {
                return;
            }

            {
                let mut inner = self.lock();
                if self.state() != ConnectionState::Connected {
                    return;
                }
                inner.transport = None;
                self.publish_status(&inner, ConnectionState::Connecting);
            }
            warn!(address = %self.address(), generation = self.generation(), "Broker link lost, reconnecting");

            transport = loop {
                let result = tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    result = self.establish() => result,
                };
                match result {
                    Ok(fresh) => break fresh,
                    Err(BusError::Connection { fatal: true, reason, .. }) => {
                        error!(address = %self.address(), reason = %reason, "Reconnect refused, giving up");
                        let inner = self.lock();
                        if self.state() == ConnectionState::Connecting {
                            self.publish_status(&inner, ConnectionState::Disconnected);
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(
                            address = %self.address(),
                            error = %e,
                            retry_in = ?self.settings.reconnect_interval,
                            "Reconnect round failed"
                        );
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(self.settings.reconnect_interval) => {}
                        }
                    }
                }
            };

            match self.install(Arc::clone(&transport)).await {
                Ok(generation) => {
                    info!(address = %self.address(), generation, "Reconnected to broker")
                }
                Err(_) => return,
            }
        }
    }

    /// Open a channel on the live transport.
    pub async fn open_channel(&self, options: ChannelOptions) -> Result<ChannelLease> {
        let (transport, generation) = {
            let inner = self.lock();
            let state = self.state();
            match (&inner.transport, state) {
                (Some(transport), ConnectionState::Connected) => {
                    (Arc::clone(transport), inner.generation)
                }
                _ => {
                    return Err(BusError::Channel(format!(
                        "cannot open channel while {}",
                        state
                    )))
                }
            }
        };
        let channel = transport.open_channel(options).await?;
        debug!(generation, "Channel opened");
        Ok(ChannelLease {
            channel,
            generation,
        })
    }

    /// Wait until connected, returning the live generation.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<u64> {
        let mut link = self.watch_link();
        let wait = link.wait_for(|s| {
            matches!(
                s.state,
                ConnectionState::Connected | ConnectionState::Closing | ConnectionState::Closed
            )
        });
        let status = match tokio::time::timeout(timeout, wait).await {
            Err(_) => return Err(BusError::Timeout(timeout)),
            Ok(Err(_)) => return Err(BusError::Closed),
            Ok(Ok(status)) => *status,
        };
        match status.state {
            ConnectionState::Connected => Ok(status.generation),
            _ => Err(BusError::Closed),
        }
    }

    /// Resolves once the transport of `generation` is no longer the live one.
    pub async fn link_lost(&self, generation: u64) {
        let mut link = self.watch_link();
        let _ = link
            .wait_for(|s| s.generation != generation || s.state != ConnectionState::Connected)
            .await;
    }

    /// Cancel every subscription, close the transport and stop reconnecting.
    pub async fn close(&self) -> Result<()> {
        let transport = {
            let mut inner = self.lock();
            match self.state() {
                ConnectionState::Closing | ConnectionState::Closed => return Ok(()),
                _ => {}
            }
            self.publish_status(&inner, ConnectionState::Closing);
            inner.transport.take()
        };
        info!(address = %self.address(), "Closing broker connection");
        self.shutdown.cancel();

        let result = match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(error = %e, "Error closing transport");
        }

        let inner = self.lock();
        self.publish_status(&inner, ConnectionState::Closed);
        result
    }

    /// Connect, run `f`, then close on every exit path.
    pub async fn scope<F, Fut, T>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(Arc<ConnectionManager>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Err(e) = self.connect().await {
            let _ = self.close().await;
            return Err(e);
        }
        let result = f(Arc::clone(self)).await;
        let closed = self.close().await;
        let value = result?;
        closed?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests;
