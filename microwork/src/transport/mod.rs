//! Broker transport abstraction.
//!
//! The service core talks to the broker only through these traits. `amqp`
//! drives a real RabbitMQ via lapin; `memory` is an in-process topic exchange
//! for broker-free tests, built with the `test-util` feature.

pub mod amqp;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{ConsumeConfig, PublishOptions, QueueConfig};
use crate::error::Result;

pub use amqp::AmqpConnector;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBroker;

/// Stream of deliveries for one consumer; ends when the consumer is cancelled
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// Opens transport connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// An open broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Whether the broker still holds this connection open
    async fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// The channel all publishes and consumes of one service multiplex over
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Idempotent topic exchange declaration
    async fn declare_topic_exchange(&self, exchange: &str) -> Result<()>;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Declare a queue and return the name the broker assigned
    async fn declare_queue(&self, queue: &str, config: &QueueConfig) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        config: &ConsumeConfig,
    ) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Fire-and-forget publish; publisher confirms are not awaited
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: &PublishOptions,
    ) -> Result<()>;

    async fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Settles a single delivery on the broker
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A delivery as it comes off the transport, before decoding
pub struct RawDelivery {
    pub data: Vec<u8>,
    pub metadata: DeliveryMetadata,
    pub acker: Arc<dyn Acknowledge>,
}

impl std::fmt::Debug for RawDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawDelivery")
            .field("bytes", &self.data.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Delivery fields and message properties visible to handlers
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryMetadata {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub consumer_tag: String,
    pub received_at: DateTime<Utc>,
    pub properties: MessageProperties,
}

/// Basic properties carried by a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageProperties {
    pub delivery_mode: Option<u8>,
    pub expiration: Option<String>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub priority: Option<u8>,
    pub headers: BTreeMap<String, String>,
}

impl From<&PublishOptions> for MessageProperties {
    fn from(options: &PublishOptions) -> Self {
        Self {
            delivery_mode: options.delivery_mode(),
            expiration: options.expiration_ms.map(|ms| ms.to_string()),
            content_type: options.content_type.clone(),
            correlation_id: options.correlation_id.clone(),
            reply_to: options.reply_to.clone(),
            message_id: options.message_id.clone(),
            priority: options.priority,
            headers: options.headers.clone(),
        }
    }
}
