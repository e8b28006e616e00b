use futures_util::future::try_join_all;
use serde::{Serialize, Serializer};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::{ConsumeConfig, PublishOptions, QueueConfig, ServiceConfig, SubscribeOptions};
use crate::connection::{ConnectOutcome, ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStats};
use crate::dispatcher::{Delivery, Dispatcher, FunctionHandler, Handler, Settlement};
use crate::error::{MicroworkError, Result};
use crate::plugin::{Plugin, PluginHost};
use crate::publish::Publisher;
use crate::registry::{SubscriptionRecord, SubscriptionRegistry, TopicSubscribers};
use crate::router::{bind_and_consume, reply_queue_name, validate_topic, work_queue_name};
use crate::transport::{AmqpConnector, Connector};

/// Service lifecycle, independent of the connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Connected or connecting, accepting operations
    Active,
    /// `stop()` is cancelling consumers and closing the connection
    Draining,
    /// Terminal
    Closed,
}

impl Serialize for Lifecycle {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(match self {
            Lifecycle::Active => "active",
            Lifecycle::Draining => "draining",
            Lifecycle::Closed => "closed",
        })
    }
}

/// A service instance on the shared topic exchange
///
/// This is the entry point of the crate - it:
/// - Connects lazily on the first `send`/`subscribe` (or eagerly via `connect`)
/// - Binds topic queues and dispatches deliveries to handlers
/// - Tracks its own consumers so they can be removed one by one or all at once
/// - Hosts plugins that build on `send`/`subscribe`
///
/// Cloning is cheap and every clone drives the same instance.
#[derive(Clone)]
pub struct MicroService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    id: String,
    config: ServiceConfig,
    connection: Arc<ConnectionManager>,
    registry: SubscriptionRegistry,
    publisher: Publisher,
    plugins: PluginHost,
    lifecycle: RwLock<Lifecycle>,
}

/// Non-owning handle, used by plugins and timers
#[derive(Clone, Debug)]
pub struct WeakService {
    inner: Weak<ServiceInner>,
}

impl WeakService {
    pub fn upgrade(&self) -> Option<MicroService> {
        self.inner.upgrade().map(|inner| MicroService { inner })
    }
}

impl MicroService {
    /// Create a service that talks AMQP to `config.host`
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_connector(config, Arc::new(AmqpConnector))
    }

    /// Convenience constructor with just a broker host and exchange name
    pub fn new_simple(host: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self::new(ServiceConfig::new(host, exchange))
    }

    /// Create a service on a custom transport
    pub fn with_connector(config: ServiceConfig, connector: Arc<dyn Connector>) -> Self {
        let id = Uuid::new_v4().to_string();
        let connection = ConnectionManager::new(ConnectionConfig::from(&config), connector);
        let publisher = Publisher::new(connection.clone(), config.default_send.clone());
        let short_id = &id[..8];
        info!(service = %short_id, "🚀 Creating microservice on exchange {}", config.exchange);

        Self {
            inner: Arc::new(ServiceInner {
                id,
                config,
                connection,
                registry: SubscriptionRegistry::new(),
                publisher,
                plugins: PluginHost::new(),
                lifecycle: RwLock::new(Lifecycle::Active),
            }),
        }
    }

    /// Unique id generated at construction
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    fn short_id(&self) -> &str {
        &self.inner.id[..8]
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Connection state, for monitoring
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.read().await
    }

    pub fn downgrade(&self) -> WeakService {
        WeakService {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Run one connection step now instead of waiting for the first operation
    pub async fn connect(&self) -> Result<ConnectOutcome> {
        self.ensure_active().await?;
        self.inner.connection.connect().await
    }

    /// Publish `data` on `topic` with the service's default options
    pub async fn send<T: Serialize + ?Sized>(&self, topic: &str, data: &T) -> Result<()> {
        self.send_with(topic, data, PublishOptions::default()).await
    }

    /// Publish with per-message options (expiration, persistence, ...)
    pub async fn send_with<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        data: &T,
        options: PublishOptions,
    ) -> Result<()> {
        self.ensure_active().await?;
        self.inner.publisher.send_with(topic, data, options).await
    }

    /// Subscribe a closure to `topic` on its shared work queue.
    ///
    /// Every instance subscribing to the same topic consumes from the same
    /// queue, so deliveries are spread across them. Returns the consumer tag.
    pub async fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Result<String>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_with(topic, FunctionHandler::new(topic, handler), SubscribeOptions::default())
            .await
    }

    /// Subscribe a handler with explicit queue, consume and ack settings
    pub async fn subscribe_with<H: Handler + 'static>(
        &self,
        topic: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<String> {
        let queue = work_queue_name(topic);
        self.consume_topic(topic, queue, Arc::new(handler), options).await
    }

    /// Subscribe on a private reply queue, so this subscriber gets its own copy
    /// of every message on `topic`
    pub async fn subscribe_reply<F, Fut>(&self, topic: &str, handler: F) -> Result<String>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let queue = reply_queue_name(&Uuid::new_v4());
        let options = SubscribeOptions::new().queue(QueueConfig::reply());
        let handler = Arc::new(FunctionHandler::new(topic, handler));
        self.consume_topic(topic, queue, handler, options).await
    }

    async fn consume_topic(
        &self,
        topic: &str,
        queue: String,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> Result<String> {
        validate_topic(topic)?;
        self.ensure_active().await?;

        let config = &self.inner.config;
        let queue_config = options.queue.unwrap_or(config.default_queue);
        let consume_config = options.consume.unwrap_or(config.default_consume);
        let settlement = Settlement::resolve(&consume_config, options.ack.unwrap_or(config.default_ack));

        let registry = &self.inner.registry;
        let guard = registry.lock_topic(topic).await;
        let subscribed = self
            .bind_topic(topic, &queue, handler, &queue_config, &consume_config, settlement)
            .await;
        registry.unlock_topic(topic, guard).await;
        subscribed
    }

    async fn bind_topic(
        &self,
        topic: &str,
        queue: &str,
        handler: Arc<dyn Handler>,
        queue_config: &QueueConfig,
        consume_config: &ConsumeConfig,
        settlement: Settlement,
    ) -> Result<String> {
        let channel = self.inner.connection.ensure_connected().await?;
        let binding = bind_and_consume(
            &channel,
            self.inner.connection.exchange(),
            topic,
            queue,
            queue_config,
            consume_config,
        )
        .await?;

        if self.lifecycle().await != Lifecycle::Active {
            // stop() began while we were binding; do not leave a consumer behind
            if let Err(e) = channel.cancel(&binding.consumer_tag).await {
                debug!("cancelling late consumer failed: {}", e);
            }
            return Err(MicroworkError::Stopped);
        }

        let span = info_span!(
            "consumer",
            service = %self.short_id(),
            topic = %topic,
            consumer_tag = %binding.consumer_tag
        );
        let consumer = Dispatcher::new(handler, self.inner.publisher.clone(), settlement)
            .spawn(binding.deliveries, span);
        self.forget_when_finished(consumer, topic, &binding.consumer_tag);

        self.inner
            .registry
            .add(SubscriptionRecord {
                topic: topic.to_string(),
                queue: binding.queue.clone(),
                consumer_tag: binding.consumer_tag.clone(),
            })
            .await;
        info!(service = %self.short_id(), "📥 subscribed to {} via {}", topic, binding.queue);
        Ok(binding.consumer_tag)
    }

    /// Drop the record of a consumer whose delivery stream ended without an
    /// unsubscribe, e.g. because the broker closed the connection
    fn forget_when_finished(&self, consumer: JoinHandle<()>, topic: &str, consumer_tag: &str) {
        let service = self.downgrade();
        let topic = topic.to_string();
        let consumer_tag = consumer_tag.to_string();
        tokio::spawn(async move {
            if let Err(e) = consumer.await {
                warn!("consumer {} on {} aborted: {}", consumer_tag, topic, e);
            }
            let Some(service) = service.upgrade() else {
                return;
            };
            let registry = &service.inner.registry;
            let guard = registry.lock_topic(&topic).await;
            if registry.remove_by_tag(&topic, &consumer_tag).await.is_ok() {
                warn!(service = %service.short_id(), "consumer {} on {} ended by the broker", consumer_tag, topic);
            }
            registry.unlock_topic(&topic, guard).await;
        });
    }

    /// Remove one consumer (by tag) or every consumer of `topic`
    pub async fn unsubscribe(&self, topic: &str, consumer_tag: Option<&str>) -> Result<()> {
        self.ensure_active().await?;
        self.remove_subscriptions(topic, consumer_tag).await
    }

    async fn remove_subscriptions(&self, topic: &str, consumer_tag: Option<&str>) -> Result<()> {
        let registry = &self.inner.registry;
        let guard = registry.lock_topic(topic).await;
        let removed = self.cancel_consumers(topic, consumer_tag).await;
        registry.unlock_topic(topic, guard).await;
        removed
    }

    async fn cancel_consumers(&self, topic: &str, consumer_tag: Option<&str>) -> Result<()> {
        let registry = &self.inner.registry;
        let records = match consumer_tag {
            Some(tag) => vec![registry.find(topic, tag).await?],
            None => {
                let records = registry.records(topic).await;
                if records.is_empty() {
                    return Err(MicroworkError::UnknownTopic {
                        topic: topic.to_string(),
                    });
                }
                records
            }
        };

        let mut channel = self.inner.connection.channel().await;
        if let Some(open) = &channel {
            if !open.is_open().await {
                // Consumers went away with a channel the broker closed
                channel = None;
            }
        }
        for record in records {
            if let Some(channel) = &channel {
                channel.cancel(&record.consumer_tag).await?;
            }
            registry.remove_by_tag(topic, &record.consumer_tag).await?;
            debug!(service = %self.short_id(), "unsubscribed {} from {}", record.consumer_tag, topic);
        }
        Ok(())
    }

    /// Cancel every consumer, close the connection and shut plugins down.
    ///
    /// Calling `stop()` again is a no-op; every other operation afterwards
    /// fails with `Stopped`.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.write().await;
            if *lifecycle != Lifecycle::Active {
                debug!(service = %self.short_id(), "stop() on a stopped service");
                return Ok(());
            }
            *lifecycle = Lifecycle::Draining;
        }
        info!(service = %self.short_id(), "🛑 Stopping microservice");

        self.inner.plugins.shutdown().await;

        let result = if self.inner.connection.is_connected() {
            let topics = self.inner.registry.list_topics().await;
            let drained = try_join_all(topics.iter().map(|topic| async move {
                match self.remove_subscriptions(topic, None).await {
                    Err(MicroworkError::UnknownTopic { .. }) => Ok(()),
                    other => other,
                }
            }))
            .await;
            let closed = self.inner.connection.close().await;
            drained.map(|_| ()).and(closed)
        } else {
            // Never connected (or lost it): only pending retries to cancel
            self.inner.connection.close().await
        };

        let leftover = self.inner.registry.clear().await;
        if !leftover.is_empty() {
            warn!(service = %self.short_id(), "dropped {} subscriptions with the channel", leftover.len());
        }
        *self.inner.lifecycle.write().await = Lifecycle::Closed;
        info!(service = %self.short_id(), "microservice stopped");
        result
    }

    /// Attach a plugin unless its name is already taken. Returns whether it was attached.
    pub async fn register_plugin<P: Plugin>(&self, plugin: P) -> bool {
        self.inner.plugins.register(Arc::new(plugin)).await
    }

    /// Registered plugin of type `P`
    pub async fn plugin<P: Plugin>(&self) -> Option<Arc<P>> {
        self.inner.plugins.get::<P>().await
    }

    pub fn plugins(&self) -> &PluginHost {
        &self.inner.plugins
    }

    /// Local consumers per topic
    pub async fn subscriptions(&self) -> Vec<TopicSubscribers> {
        self.inner.registry.counts().await
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// Get service statistics
    pub async fn get_stats(&self) -> ServiceStats {
        ServiceStats {
            id: self.inner.id.clone(),
            lifecycle: self.lifecycle().await,
            connection: self.inner.connection.stats(),
            subscriptions: self.subscriptions().await,
            plugins: self.inner.plugins.names().await,
        }
    }

    async fn ensure_active(&self) -> Result<()> {
        match self.lifecycle().await {
            Lifecycle::Active => Ok(()),
            Lifecycle::Draining | Lifecycle::Closed => Err(MicroworkError::Stopped),
        }
    }
}

impl std::fmt::Debug for MicroService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroService")
            .field("id", &self.inner.id)
            .field("exchange", &self.inner.config.exchange)
            .field("connection", &self.inner.connection)
            .field("plugins", &self.inner.plugins)
            .finish()
    }
}

/// Service statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub id: String,
    pub lifecycle: Lifecycle,
    pub connection: ConnectionStats,
    pub subscriptions: Vec<TopicSubscribers>,
    pub plugins: Vec<String>,
}
