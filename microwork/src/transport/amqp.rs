use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{
    Acknowledge, BrokerChannel, BrokerConnection, Connector, DeliveryMetadata, DeliveryStream,
    MessageProperties, RawDelivery,
};
use crate::config::{ConsumeConfig, PublishOptions, QueueConfig};
use crate::error::{MicroworkError, Result};

/// Connects to RabbitMQ (or any AMQP 0-9-1 broker) through lapin
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        debug!("Attempting to connect to {}", redact(uri));

        let connection = Connection::connect(
            uri,
            ConnectionProperties::default()
                .with_connection_name(format!("microwork-{}", Uuid::new_v4()).into()),
        )
        .await
        .map_err(|e| {
            let err = MicroworkError::Connection(e);
            if err.is_connection_refused() {
                MicroworkError::ConnectionRefused { host: redact(uri) }
            } else {
                err
            }
        })?;

        debug!("AMQP connection established");
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        debug!("Created new channel");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "OK").await?;
        }
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_topic_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!("Declared topic exchange: {}", exchange);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, config: &QueueConfig) -> Result<String> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: config.durable,
                    exclusive: config.exclusive,
                    auto_delete: config.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!("Declared queue: {}", declared.name().as_str());
        Ok(declared.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        config: &ConsumeConfig,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: config.no_ack,
                    exclusive: config.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!("Created consumer {} for queue: {}", consumer_tag, queue);
        let tag = consumer_tag.to_string();
        Ok(consumer
            .map(move |delivery| {
                delivery
                    .map(|d| into_raw(d, &tag))
                    .map_err(MicroworkError::from)
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: &PublishOptions,
    ) -> Result<()> {
        // Publisher confirms are not awaited
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                basic_properties(options),
            )
            .await?;
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "OK").await?;
        }
        Ok(())
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

fn into_raw(delivery: Delivery, consumer_tag: &str) -> RawDelivery {
    let properties = &delivery.properties;
    let metadata = DeliveryMetadata {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        consumer_tag: consumer_tag.to_string(),
        received_at: Utc::now(),
        properties: MessageProperties {
            delivery_mode: *properties.delivery_mode(),
            expiration: properties.expiration().as_ref().map(|s| s.as_str().to_string()),
            content_type: properties
                .content_type()
                .as_ref()
                .map(|s| s.as_str().to_string()),
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|s| s.as_str().to_string()),
            reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
            message_id: properties
                .message_id()
                .as_ref()
                .map(|s| s.as_str().to_string()),
            priority: *properties.priority(),
            headers: properties
                .headers()
                .as_ref()
                .map(string_headers)
                .unwrap_or_default(),
        },
    };

    RawDelivery {
        data: delivery.data,
        metadata,
        acker: Arc::new(AmqpAcker {
            acker: delivery.acker,
        }),
    }
}

fn basic_properties(options: &PublishOptions) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if let Some(mode) = options.delivery_mode() {
        properties = properties.with_delivery_mode(mode);
    }
    if let Some(ms) = options.expiration_ms {
        properties = properties.with_expiration(ms.to_string().into());
    }
    if let Some(content_type) = &options.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }
    if let Some(id) = &options.correlation_id {
        properties = properties.with_correlation_id(id.clone().into());
    }
    if let Some(reply_to) = &options.reply_to {
        properties = properties.with_reply_to(reply_to.clone().into());
    }
    if let Some(id) = &options.message_id {
        properties = properties.with_message_id(id.clone().into());
    }
    if let Some(priority) = options.priority {
        properties = properties.with_priority(priority);
    }
    if !options.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &options.headers {
            table.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
        }
        properties = properties.with_headers(table);
    }
    properties
}

fn string_headers(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

/// Strip credentials from a broker URI before it reaches logs or errors
fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}{}", &uri[..scheme_end + 3], &uri[at + 1..])
        }
        _ => uri.to_string(),
    }
}
