//! In-process simulated broker.
//!
//! Implements both broker models behind the capability traits:
//! - log model: topics split into partitions, records addressed by offset,
//!   consumer groups with committed offsets
//! - routing model: exchanges (direct/topic/fanout) bound to queues, the
//!   default exchange `""` routing to the queue of the same name, unacked
//!   deliveries requeued when their channel or connection goes away
//!
//! Exposes fault injection for tests: link drops, unreachable broker,
//! refused connects, held publisher confirms.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::{self, FutureExt};
use futures::stream::{self, StreamExt};
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, info};

use super::{
    AckMode, BusError, Channel, ChannelOptions, Confirmation, Connector, Delivery, DeliveryAcker,
    DeliveryStream, Locator, Result, Transport,
};
use crate::config::BrokerConfig;
use crate::envelope::WireMessage;
use crate::routing::{binding_matches, Destination, DestinationFilter, ExchangeKind, QueueOptions, Source};

/// Behaviour knobs of a simulated broker.
#[derive(Debug, Clone)]
pub struct MemorySettings {
    /// Partitions of auto-created topics.
    pub partitions: i32,
    /// Create unknown topics on first publish or subscribe.
    pub auto_create_topics: bool,
    pub username: String,
    pub password: String,
    /// Namespaces (vhosts) that accept connections.
    pub namespaces: Vec<String>,
    /// Most recent messages kept for [`MemoryBroker::arrivals`]; older ones are dropped.
    pub arrivals_capacity: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            partitions: 1,
            auto_create_topics: true,
            username: "guest".to_string(),
            password: "guest".to_string(),
            namespaces: vec!["/".to_string()],
            arrivals_capacity: 1024,
        }
    }
}

/// (connection id, channel id)
type Owner = (u64, u64);

#[derive(Debug, Clone)]
struct Queued {
    message: WireMessage,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Queued>,
    unacked: BTreeMap<u64, (Owner, Queued)>,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

struct HeldConfirm {
    connection: u64,
    sender: oneshot::Sender<Result<Locator>>,
    result: Result<Locator>,
}

/// (group, topic, partition)
type GroupPartition = (String, String, i32);

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    refuse_next: usize,
    connect_attempts: usize,
    next_id: u64,
    connections: HashMap<u64, watch::Sender<bool>>,
    channels: HashSet<Owner>,
    topics: HashMap<String, Vec<Vec<WireMessage>>>,
    committed: HashMap<GroupPartition, i64>,
    /// Highest offset + 1 ever handed to a group; earlier offsets are redeliveries.
    delivered: HashMap<GroupPartition, i64>,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    publish_seq: u64,
    delivery_seq: u64,
    holding: bool,
    held: Vec<HeldConfirm>,
    arrivals: VecDeque<WireMessage>,
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    settings: MemorySettings,
}

/// Handle to a simulated broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_settings(MemorySettings::default())
    }

    pub fn with_settings(settings: MemorySettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                settings,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.inner.notify.notify_waiters();
    }

    /// Connector with the default credentials and namespace.
    pub fn connector(&self) -> MemoryConnector {
        let settings = &self.inner.settings;
        self.connector_with(&settings.username, &settings.password, "/")
    }

    pub fn connector_with(&self, username: &str, password: &str, namespace: &str) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            username: username.to_string(),
            password: password.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Connector using the credentials and namespace of a broker config.
    pub fn connector_for(&self, config: &BrokerConfig) -> MemoryConnector {
        self.connector_with(&config.username, &config.password, &config.namespace)
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Drop every live connection, as a network partition would.
    pub fn drop_connections(&self) {
        let ids: Vec<u64> = self.lock().connections.keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
    }

    /// Refuse (or accept again) every connect attempt.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Refuse the next `count` connect attempts with a transient error.
    pub fn refuse_connections(&self, count: usize) {
        self.lock().refuse_next = count;
    }

    /// Keep publisher confirms pending until [`release_confirms`](Self::release_confirms).
    pub fn hold_confirms(&self) {
        self.lock().holding = true;
    }

    /// Resolve every held confirm and stop holding.
    pub fn release_confirms(&self) {
        let held = {
            let mut state = self.lock();
            state.holding = false;
            std::mem::take(&mut state.held)
        };
        for confirm in held {
            let _ = confirm.sender.send(confirm.result);
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Most recent messages the broker received, oldest first.
    pub fn arrivals(&self) -> Vec<WireMessage> {
        self.lock().arrivals.iter().cloned().collect()
    }

    /// Messages waiting in a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from a queue but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Records stored in a topic across all partitions.
    pub fn topic_len(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map_or(0, |partitions| partitions.iter().map(Vec::len).sum())
    }

    /// Next offset a group will read from a partition.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    pub fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        self.lock().declare_queue(queue, options)
    }

    /// Declare an exchange and bind a queue to it.
    pub fn bind(&self, exchange: &str, kind: ExchangeKind, queue: &str, binding_key: &str) -> Result<()> {
        let mut state = self.lock();
        state.declare_exchange(exchange, kind)?;
        state.bind(exchange, queue, binding_key)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn disconnect(&self, connection: u64) {
        {
            let mut state = self.lock();
            if let Some(alive) = state.connections.remove(&connection) {
                let _ = alive.send(false);
            }
            let owned: Vec<Owner> = state
                .channels
                .iter()
                .filter(|(conn, _)| *conn == connection)
                .copied()
                .collect();
            for owner in owned {
                state.release_channel(owner);
            }
            // Dropped senders resolve the pending confirms as lost.
            state.held.retain(|confirm| confirm.connection != connection);
        }
        debug!(connection, "Memory connection closed");
        self.wake();
    }

    fn close_channel(&self, owner: Owner) {
        self.lock().release_channel(owner);
        self.wake();
    }

    fn settle(&self, queue: &str, tag: u64) -> Result<()> {
        let settled = {
            let mut state = self.lock();
            state
                .queues
                .get_mut(queue)
                .and_then(|q| q.unacked.remove(&tag))
                .is_some()
        };
        if !settled {
            return Err(BusError::Channel(format!(
                "unknown delivery tag {} on queue '{}'",
                tag, queue
            )));
        }
        self.wake();
        Ok(())
    }

    fn commit(&self, group: &str, topic: &str, partition: i32, next_offset: i64) {
        self.lock().commit(group, topic, partition, next_offset);
    }
}

impl BrokerState {
    fn is_open(&self, owner: Owner) -> bool {
        self.connections.contains_key(&owner.0) && self.channels.contains(&owner)
    }

    /// Forget a channel and requeue what it left unacknowledged.
    fn release_channel(&mut self, owner: Owner) {
        self.channels.remove(&owner);
        for queue in self.queues.values_mut() {
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (o, _))| *o == owner)
                .map(|(tag, _)| *tag)
                .collect();
            // Requeue at the head, preserving the original order.
            for tag in tags.into_iter().rev() {
                if let Some((_, mut queued)) = queue.unacked.remove(&tag) {
                    queued.redelivered = true;
                    queue.ready.push_front(queued);
                }
            }
        }
    }

    fn declare_queue(&mut self, name: &str, options: QueueOptions) -> Result<()> {
        match self.queues.get(name) {
            Some(existing) if existing.options != options => Err(BusError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent flags for queue '{}'",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    name.to_string(),
                    QueueState {
                        options,
                        ready: VecDeque::new(),
                        unacked: BTreeMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BusError::Channel(format!(
                "PRECONDITION_FAILED - exchange '{}' is {}, not {}",
                name, existing.kind, kind
            ))),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn bind(&mut self, exchange: &str, queue: &str, binding_key: &str) -> Result<()> {
        if !self.queues.contains_key(queue) {
            self.declare_queue(queue, QueueOptions::default())?;
        }
        let state = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange)))?;
        let binding = (queue.to_string(), binding_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn record_arrival(&mut self, message: &WireMessage, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.arrivals.len() >= capacity {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(message.clone());
    }

    fn ensure_topic(&mut self, topic: &str, settings: &MemorySettings) -> Result<()> {
        if self.topics.contains_key(topic) {
            return Ok(());
        }
        if !settings.auto_create_topics {
            return Err(BusError::Unroutable(format!(
                "unknown topic or partition '{}'",
                topic
            )));
        }
        let partitions = settings.partitions.max(1) as usize;
        self.topics.insert(topic.to_string(), vec![Vec::new(); partitions]);
        Ok(())
    }

    fn commit(&mut self, group: &str, topic: &str, partition: i32, next_offset: i64) {
        let committed = self
            .committed
            .entry((group.to_string(), topic.to_string(), partition))
            .or_insert(0);
        *committed = (*committed).max(next_offset);
    }

    /// Store a message at its destination and report where it landed.
    fn route(
        &mut self,
        destination: &Destination,
        message: &WireMessage,
        settings: &MemorySettings,
    ) -> Result<Locator> {
        match destination {
            Destination::Topic {
                topic,
                partition_key,
            } => {
                self.ensure_topic(topic, settings)?;
                let partitions = self.topics.get_mut(topic).ok_or_else(|| {
                    BusError::Unroutable(format!("unknown topic or partition '{}'", topic))
                })?;
                let partition = partition_for(partition_key.as_deref(), partitions.len());
                let log = &mut partitions[partition];
                log.push(message.clone());
                Ok(Locator::Offset {
                    topic: topic.clone(),
                    partition: partition as i32,
                    offset: log.len() as i64 - 1,
                })
            }
            Destination::Exchange {
                exchange,
                routing_key,
                kind,
            } => {
                let targets: Vec<String> = if exchange.is_empty() {
                    if self.queues.contains_key(routing_key) {
                        vec![routing_key.clone()]
                    } else {
                        Vec::new()
                    }
                } else {
                    self.declare_exchange(exchange, *kind)?;
                    let mut targets: Vec<String> = Vec::new();
                    if let Some(state) = self.exchanges.get(exchange) {
                        for (queue, binding_key) in &state.bindings {
                            if binding_matches(state.kind, binding_key, routing_key)
                                && !targets.contains(queue)
                            {
                                targets.push(queue.clone());
                            }
                        }
                    }
                    targets
                };

                if targets.is_empty() {
                    return Err(BusError::Unroutable(format!(
                        "NO_ROUTE - exchange '{}' routing key '{}'",
                        exchange, routing_key
                    )));
                }
                for queue in targets {
                    if let Some(state) = self.queues.get_mut(&queue) {
                        state.ready.push_back(Queued {
                            message: message.clone(),
                            redelivered: false,
                        });
                    }
                }
                self.publish_seq += 1;
                Ok(Locator::DeliveryTag {
                    tag: self.publish_seq,
                })
            }
        }
    }

    /// Declare what a filter needs and describe the resulting subscription.
    fn register(&mut self, filter: &DestinationFilter, settings: &MemorySettings) -> Result<Subscription> {
        match &filter.source {
            Source::Topics(topics) => {
                for topic in topics {
                    self.ensure_topic(topic, settings).map_err(|e| BusError::Channel(e.to_string()))?;
                }
                Ok(Subscription::Topics {
                    group: filter.consumer.clone(),
                    topics: topics.clone(),
                    positions: HashMap::new(),
                })
            }
            Source::Queue => {
                self.declare_queue(&filter.consumer, filter.queue)?;
                Ok(Subscription::Queue {
                    queue: filter.consumer.clone(),
                })
            }
            Source::Exchange {
                exchange,
                kind,
                binding_keys,
            } => {
                self.declare_exchange(exchange, *kind)?;
                self.declare_queue(&filter.consumer, filter.queue)?;
                if !exchange.is_empty() {
                    for key in binding_keys {
                        self.bind(exchange, &filter.consumer, key)?;
                    }
                }
                Ok(Subscription::Queue {
                    queue: filter.consumer.clone(),
                })
            }
        }
    }
}

fn partition_for(key: Option<&str>, partitions: usize) -> usize {
    match key {
        Some(key) => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % partitions as u64) as usize
        }
        None => 0,
    }
}

// ============================================================================
// Connector / Transport
// ============================================================================

/// Connects to a [`MemoryBroker`] with fixed credentials and namespace.
pub struct MemoryConnector {
    broker: MemoryBroker,
    username: String,
    password: String,
    namespace: String,
}

#[async_trait]
impl Connector for MemoryConnector {
    fn address(&self) -> String {
        format!("memory://{}", self.namespace)
    }

    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let address = self.address();
        let settings = &self.broker.inner.settings;
        let (connection, alive) = {
            let mut state = self.broker.lock();
            state.connect_attempts += 1;
            if state.unreachable {
                return Err(BusError::connection(address, "connection refused"));
            }
            if state.refuse_next > 0 {
                state.refuse_next -= 1;
                return Err(BusError::connection(address, "connection reset by peer"));
            }
            if self.username != settings.username || self.password != settings.password {
                return Err(BusError::fatal_connection(
                    address,
                    "ACCESS_REFUSED - Login was refused",
                ));
            }
            if !settings.namespaces.contains(&self.namespace) {
                return Err(BusError::fatal_connection(
                    address,
                    format!("NOT_ALLOWED - vhost '{}' not found", self.namespace),
                ));
            }
            state.next_id += 1;
            let id = state.next_id;
            let (tx, rx) = watch::channel(true);
            state.connections.insert(id, tx);
            (id, rx)
        };

        info!(connection, address = %self.address(), "Memory connection established");
        Ok(Arc::new(MemoryTransport {
            broker: self.broker.clone(),
            connection,
            alive,
            next_channel: AtomicU64::new(1),
        }))
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    connection: u64,
    alive: watch::Receiver<bool>,
    next_channel: AtomicU64,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_channel(&self, options: ChannelOptions) -> Result<Box<dyn Channel>> {
        let owner = (
            self.connection,
            self.next_channel.fetch_add(1, Ordering::Relaxed),
        );
        {
            let mut state = self.broker.lock();
            if !state.connections.contains_key(&self.connection) {
                return Err(BusError::ConnectionLost);
            }
            state.channels.insert(owner);
        }
        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            owner,
            options,
        }))
    }

    async fn closed(&self) {
        let mut alive = self.alive.clone();
        let _ = alive.wait_for(|up| !*up).await;
    }

    async fn close(&self) -> Result<()> {
        self.broker.disconnect(self.connection);
        Ok(())
    }
}

// ============================================================================
// Channel
// ============================================================================

/// Logical channel on a [`MemoryTransport`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    owner: Owner,
    options: ChannelOptions,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, destination: &Destination, message: &WireMessage) -> Result<Confirmation> {
        let confirmation = {
            let mut state = self.broker.lock();
            if !state.connections.contains_key(&self.owner.0) {
                return Err(BusError::ConnectionLost);
            }
            if !state.channels.contains(&self.owner) {
                return Err(BusError::Channel("channel closed".to_string()));
            }
            state.record_arrival(message, self.broker.inner.settings.arrivals_capacity);
            let result = state.route(destination, message, &self.broker.inner.settings);
            if let Err(BusError::Channel(reason)) = &result {
                return Err(BusError::Channel(reason.clone()));
            }

            if !self.options.confirm {
                // Without confirms the broker never reports unroutable messages.
                future::ready(Ok(Locator::Unconfirmed)).boxed()
            } else if state.holding {
                let (sender, receiver) = oneshot::channel();
                state.held.push(HeldConfirm {
                    connection: self.owner.0,
                    sender,
                    result,
                });
                async move { receiver.await.unwrap_or(Err(BusError::ConnectionLost)) }.boxed()
            } else {
                future::ready(result).boxed()
            }
        };
        self.broker.wake();
        Ok(confirmation)
    }

    async fn consume(&self, filter: &DestinationFilter, ack_mode: AckMode) -> Result<DeliveryStream> {
        let subscription = {
            let mut state = self.broker.lock();
            if !state.is_open(self.owner) {
                return Err(BusError::ConnectionLost);
            }
            state.register(filter, &self.broker.inner.settings)?
        };
        debug!(owner = ?self.owner, consumer = %filter.consumer, "Memory consumer registered");

        let cursor = Cursor {
            broker: self.broker.clone(),
            owner: self.owner,
            subscription,
            ack_mode,
            prefetch: self.options.prefetch,
        };
        Ok(stream::unfold(cursor, |mut cursor| async move {
            let delivery = cursor.next().await?;
            Some((Ok(delivery), cursor))
        })
        .boxed())
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_channel(self.owner);
        Ok(())
    }
}

// ============================================================================
// Consumption
// ============================================================================

enum Subscription {
    Topics {
        group: String,
        topics: Vec<String>,
        /// Next offset per (topic, partition), seeded from the committed offset.
        positions: HashMap<(String, i32), i64>,
    },
    Queue {
        queue: String,
    },
}

enum Take {
    Ready(Delivery),
    Empty,
    Closed,
}

struct Cursor {
    broker: MemoryBroker,
    owner: Owner,
    subscription: Subscription,
    ack_mode: AckMode,
    prefetch: u16,
}

impl Cursor {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let inner = Arc::clone(&self.broker.inner);
            // Registered before looking, so a publish in between still wakes us.
            let notified = inner.notify.notified();
            match self.take() {
                Take::Ready(delivery) => return Some(delivery),
                Take::Closed => return None,
                Take::Empty => notified.await,
            }
        }
    }

    fn take(&mut self) -> Take {
        let mut state = self.broker.lock();
        if !state.is_open(self.owner) {
            return Take::Closed;
        }
        match &mut self.subscription {
            Subscription::Queue { queue } => {
                let state = &mut *state;
                let Some(queue_state) = state.queues.get_mut(queue.as_str()) else {
                    return Take::Closed;
                };
                let in_flight = queue_state
                    .unacked
                    .values()
                    .filter(|(owner, _)| *owner == self.owner)
                    .count();
                if self.ack_mode == AckMode::Manual
                    && self.prefetch > 0
                    && in_flight >= self.prefetch as usize
                {
                    return Take::Empty;
                }
                let Some(queued) = queue_state.ready.pop_front() else {
                    return Take::Empty;
                };

                state.delivery_seq += 1;
                let tag = state.delivery_seq;
                let acker: Box<dyn DeliveryAcker> = match self.ack_mode {
                    AckMode::Auto => Box::new(NoopAcker),
                    AckMode::Manual => {
                        queue_state.unacked.insert(tag, (self.owner, queued.clone()));
                        Box::new(QueueAcker {
                            broker: self.broker.clone(),
                            queue: queue.clone(),
                            tag,
                        })
                    }
                };
                Take::Ready(Delivery::new(
                    queued.message,
                    Locator::DeliveryTag { tag },
                    queued.redelivered,
                    acker,
                ))
            }
            Subscription::Topics {
                group,
                topics,
                positions,
            } => {
                for topic in topics.iter() {
                    let partitions = state.topics.get(topic).map_or(0, Vec::len);
                    for partition in 0..partitions as i32 {
                        let slot = (group.clone(), topic.clone(), partition);
                        let position = *positions
                            .entry((topic.clone(), partition))
                            .or_insert_with(|| state.committed.get(&slot).copied().unwrap_or(0));
                        let Some(message) = state
                            .topics
                            .get(topic)
                            .and_then(|p| p.get(partition as usize))
                            .and_then(|log| log.get(position as usize))
                            .cloned()
                        else {
                            continue;
                        };

                        positions.insert((topic.clone(), partition), position + 1);
                        let high_water = state.delivered.entry(slot).or_insert(0);
                        let redelivered = position < *high_water;
                        *high_water = (*high_water).max(position + 1);

                        let acker: Box<dyn DeliveryAcker> = match self.ack_mode {
                            AckMode::Auto => {
                                state.commit(group, topic, partition, position + 1);
                                Box::new(NoopAcker)
                            }
                            AckMode::Manual => Box::new(OffsetAcker {
                                broker: self.broker.clone(),
                                group: group.clone(),
                                topic: topic.clone(),
                                partition,
                                offset: position,
                            }),
                        };
                        return Take::Ready(Delivery::new(
                            message,
                            Locator::Offset {
                                topic: topic.clone(),
                                partition,
                                offset: position,
                            },
                            redelivered,
                            acker,
                        ));
                    }
                }
                Take::Empty
            }
        }
    }
}

/// Acker for deliveries already settled on receipt.
struct NoopAcker;

#[async_trait]
impl DeliveryAcker for NoopAcker {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        Ok(())
    }
}

struct QueueAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
}

#[async_trait]
impl DeliveryAcker for QueueAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(&self.queue, self.tag)
    }

    async fn reject(&self) -> Result<()> {
        self.broker.settle(&self.queue, self.tag)
    }
}

/// Commits `offset + 1` for the group; rejecting skips the record the same way.
struct OffsetAcker {
    broker: MemoryBroker,
    group: String,
    topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl DeliveryAcker for OffsetAcker {
    async fn ack(&self) -> Result<()> {
        self.broker
            .commit(&self.group, &self.topic, self.partition, self.offset + 1);
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.ack().await
    }
}
