//! In-process topic exchange.
//!
//! Models the parts of AMQP 0-9-1 a service relies on: topic bindings with
//! `*`/`#` wildcards, per-channel prefetch with round-robin over consumers,
//! manual ack/nack with requeue, auto-delete and exclusive queues, and
//! requeue of unacked deliveries when a channel closes. It can also pretend
//! to be unreachable and counts connection attempts.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{stream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::{
    Acknowledge, BrokerChannel, BrokerConnection, Connector, DeliveryMetadata, DeliveryStream,
    MessageProperties, RawDelivery,
};
use crate::config::{ConsumeConfig, PublishOptions, QueueConfig};
use crate::error::{MicroworkError, Result};
use crate::router::topic_matches;

const TOPIC: &str = "topic";

/// Shared handle to an in-memory broker; clones see the same state
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    unreachable: AtomicBool,
    connect_attempts: AtomicUsize,
    next_id: AtomicU64,
    next_delivery_tag: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    /// consumer tag -> (queue, channel id)
    consumers: HashMap<String, (String, u64)>,
    connections: HashSet<u64>,
    /// channel id -> owning connection id
    channels: HashMap<u64, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

struct QueueState {
    config: QueueConfig,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    had_consumer: bool,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    prefetch: u16,
    no_ack: bool,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<RawDelivery>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    message: StoredMessage,
    consumer_tag: String,
    channel_id: u64,
}

fn broker_error(code: u16, reason: impl Into<String>) -> MicroworkError {
    MicroworkError::Broker {
        code,
        reason: reason.into(),
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connection attempts fail with `ConnectionRefused`
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Number of connection attempts seen, refused ones included
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Declare an exchange of an arbitrary kind, e.g. to provoke a type conflict
    pub async fn declare_exchange(&self, name: &str, kind: &str) {
        let mut state = self.inner.state.lock().await;
        state.exchanges.insert(name.to_string(), kind.to_string());
    }

    pub async fn has_exchange(&self, name: &str) -> bool {
        self.inner.state.lock().await.exchanges.contains_key(name)
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ready (undelivered) messages in a queue
    pub async fn message_count(&self, queue: &str) -> Option<usize> {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.messages.len())
    }

    pub async fn consumer_count(&self, queue: &str) -> Option<usize> {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.consumers.len())
    }

    pub async fn open_connections(&self) -> usize {
        self.inner.state.lock().await.connections.len()
    }

    pub async fn open_channels(&self) -> usize {
        self.inner.state.lock().await.channels.len()
    }

    /// Close every client connection from the broker side, as a restart would
    pub async fn drop_connections(&self) {
        let mut state = self.inner.state.lock().await;
        let connections: Vec<u64> = state.connections.iter().copied().collect();
        for connection in connections {
            close_connection(&mut state, &self.inner, connection);
        }
        debug!("memory broker dropped every connection");
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        // Real connects suspend; give concurrent callers a chance to observe `Connecting`
        tokio::task::yield_now().await;

        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(MicroworkError::ConnectionRefused {
                host: uri.to_string(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.lock().await.connections.insert(id);
        debug!("memory broker accepted connection {}", id);
        Ok(Arc::new(MemoryConnection {
            broker: self.inner.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.state.lock().await;
        if !state.connections.contains(&self.id) {
            return Err(broker_error(320, "CONNECTION_FORCED - connection closed"));
        }
        let id = self.broker.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        state.channels.insert(id, self.id);
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection_id: self.id,
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn is_open(&self) -> bool {
        self.broker.state.lock().await.connections.contains(&self.id)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        close_connection(&mut state, &self.broker, self.id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: Arc<BrokerInner>,
    id: u64,
    connection_id: u64,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<()> {
        if state.channels.contains_key(&self.id) {
            Ok(())
        } else {
            Err(broker_error(504, "CHANNEL_ERROR - channel closed"))
        }
    }

    fn ensure_accessible(&self, queue: &str, state: &QueueState) -> Result<()> {
        match state.owner {
            Some(owner) if owner != self.connection_id => Err(broker_error(
                405,
                format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    queue
                ),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_topic_exchange(&self, exchange: &str) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        self.ensure_open(&state)?;
        match state.exchanges.get(exchange) {
            Some(kind) if kind != TOPIC => Err(broker_error(
                406,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received 'topic' but current is '{}'",
                    exchange, kind
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.to_string(), TOPIC.to_string());
                Ok(())
            }
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let state = self.broker.state.lock().await;
        self.ensure_open(&state)?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, config: &QueueConfig) -> Result<String> {
        let mut state = self.broker.state.lock().await;
        self.ensure_open(&state)?;

        let name = if queue.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            queue.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            self.ensure_accessible(&name, existing)?;
            let current = existing.config;
            let mismatch = [
                ("durable", config.durable, current.durable),
                ("exclusive", config.exclusive, current.exclusive),
                ("auto_delete", config.auto_delete, current.auto_delete),
            ]
            .into_iter()
            .find(|(_, received, current)| received != current);
            if let Some((arg, received, current)) = mismatch {
                return Err(broker_error(
                    406,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg '{}' for queue '{}' in vhost '/': received '{}' but current is '{}'",
                        arg, name, received, current
                    ),
                ));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                config: *config,
                owner: config.exclusive.then_some(self.connection_id),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                had_consumer: false,
                unacked: HashMap::new(),
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        self.ensure_open(&state)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(broker_error(404, format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        let existing = state
            .queues
            .get(queue)
            .ok_or_else(|| broker_error(404, format!("NOT_FOUND - no queue '{}'", queue)))?;
        self.ensure_accessible(queue, existing)?;

        let binding = Binding {
            exchange: exchange.to_string(),
            pattern: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        config: &ConsumeConfig,
    ) -> Result<DeliveryStream> {
        let mut state = self.broker.state.lock().await;
        self.ensure_open(&state)?;
        if state.consumers.contains_key(consumer_tag) {
            return Err(broker_error(
                530,
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", consumer_tag),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| broker_error(404, format!("NOT_FOUND - no queue '{}'", queue)))?;
            self.ensure_accessible(queue, target)?;
            if config.exclusive && !target.consumers.is_empty() {
                return Err(broker_error(
                    403,
                    format!("ACCESS_REFUSED - queue '{}' in exclusive use", queue),
                ));
            }
            target.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_string(),
                channel_id: self.id,
                prefetch: self.prefetch.load(Ordering::SeqCst),
                no_ack: config.no_ack,
                in_flight: 0,
                sender,
            });
            target.had_consumer = true;
        }
        state
            .consumers
            .insert(consumer_tag.to_string(), (queue.to_string(), self.id));
        pump(&mut state, &self.broker, queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        self.ensure_open(&state)?;
        cancel_consumer(&mut state, consumer_tag);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: &PublishOptions,
    ) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        self.ensure_open(&state)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(broker_error(404, format!("NOT_FOUND - no exchange '{}'", exchange)));
        }

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            debug!("dropping unroutable message for {}", routing_key);
            return Ok(());
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            properties: MessageProperties::from(options),
            redelivered: false,
        };
        for queue in targets {
            if let Some(target) = state.queues.get_mut(&queue) {
                target.messages.push_back(message.clone());
            }
            pump(&mut state, &self.broker, &queue);
        }
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.broker.state.lock().await.channels.contains_key(&self.id)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        close_channel(&mut state, &self.broker, self.id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: Arc<BrokerInner>,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    async fn settle(&self, requeue: bool) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            // Queue already deleted along with its unacked deliveries
            return Ok(());
        };
        let entry = queue.unacked.remove(&self.delivery_tag).ok_or_else(|| {
            broker_error(
                406,
                format!("PRECONDITION_FAILED - unknown delivery tag {}", self.delivery_tag),
            )
        })?;
        if let Some(slot) = queue.consumers.iter_mut().find(|c| c.tag == entry.consumer_tag) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        if requeue {
            let mut message = entry.message;
            message.redelivered = true;
            queue.messages.push_front(message);
        }
        pump(&mut state, &self.broker, &self.queue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(false).await
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(requeue).await
    }
}

/// Hand ready messages to consumers with spare prefetch, round-robin
fn pump(state: &mut BrokerState, broker: &Arc<BrokerInner>, queue_name: &str) {
    let mut gone = Vec::new();
    if let Some(queue) = state.queues.get_mut(queue_name) {
        loop {
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                break;
            }
            let count = queue.consumers.len();
            let start = queue.next_consumer % count;
            let Some(idx) = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                break;
            };
            let Some(message) = queue.messages.pop_front() else {
                break;
            };

            let delivery_tag = broker.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let slot = &mut queue.consumers[idx];
            let raw = RawDelivery {
                data: message.payload.clone(),
                metadata: DeliveryMetadata {
                    delivery_tag,
                    redelivered: message.redelivered,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    consumer_tag: slot.tag.clone(),
                    received_at: Utc::now(),
                    properties: message.properties.clone(),
                },
                acker: Arc::new(MemoryAcker {
                    broker: broker.clone(),
                    queue: queue_name.to_string(),
                    delivery_tag,
                }),
            };

            if slot.sender.send(Ok(raw)).is_err() {
                // Receiver dropped without a cancel
                gone.push(slot.tag.clone());
                queue.consumers.remove(idx);
                queue.messages.push_front(message);
                continue;
            }

            if !slot.no_ack {
                slot.in_flight += 1;
                queue.unacked.insert(
                    delivery_tag,
                    Unacked {
                        message,
                        consumer_tag: slot.tag.clone(),
                        channel_id: slot.channel_id,
                    },
                );
            }
            queue.next_consumer = (idx + 1) % count;
        }
    }
    for tag in gone {
        state.consumers.remove(&tag);
    }
}

fn cancel_consumer(state: &mut BrokerState, consumer_tag: &str) {
    let Some((queue_name, _)) = state.consumers.remove(consumer_tag) else {
        return;
    };
    let delete = match state.queues.get_mut(&queue_name) {
        Some(queue) => {
            // Dropping the slot closes its sender, which ends the consumer stream
            queue.consumers.retain(|c| c.tag != consumer_tag);
            queue.config.auto_delete && queue.had_consumer && queue.consumers.is_empty()
        }
        None => false,
    };
    if delete {
        debug!("auto-deleting queue {}", queue_name);
        delete_queue(state, &queue_name);
    }
}

fn close_connection(state: &mut BrokerState, broker: &Arc<BrokerInner>, connection_id: u64) {
    let channels: Vec<u64> = state
        .channels
        .iter()
        .filter(|(_, conn)| **conn == connection_id)
        .map(|(channel, _)| *channel)
        .collect();
    for channel in channels {
        close_channel(state, broker, channel);
    }

    let exclusive: Vec<String> = state
        .queues
        .iter()
        .filter(|(_, q)| q.owner == Some(connection_id))
        .map(|(name, _)| name.clone())
        .collect();
    for queue in exclusive {
        delete_queue(state, &queue);
    }

    state.connections.remove(&connection_id);
}

fn close_channel(state: &mut BrokerState, broker: &Arc<BrokerInner>, channel_id: u64) {
    if state.channels.remove(&channel_id).is_none() {
        return;
    }

    let tags: Vec<String> = state
        .consumers
        .iter()
        .filter(|(_, (_, channel))| *channel == channel_id)
        .map(|(tag, _)| tag.clone())
        .collect();
    for tag in &tags {
        cancel_consumer(state, tag);
    }

    let mut touched = Vec::new();
    for (name, queue) in state.queues.iter_mut() {
        let orphaned: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, entry)| entry.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        if orphaned.is_empty() {
            continue;
        }
        for tag in orphaned {
            if let Some(entry) = queue.unacked.remove(&tag) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
        touched.push(name.clone());
    }
    for name in touched {
        pump(state, broker, &name);
    }
}

fn delete_queue(state: &mut BrokerState, queue_name: &str) {
    if let Some(queue) = state.queues.remove(queue_name) {
        for slot in queue.consumers {
            state.consumers.remove(&slot.tag);
        }
    }
    state.bindings.retain(|b| b.queue != queue_name);
}
