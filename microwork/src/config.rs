use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Exchange used when none is configured
pub const DEFAULT_EXCHANGE: &str = "microwork.default.exchange";

/// Channel prefetch applied on every connection; keeps competing consumers fair
pub const PREFETCH_COUNT: u16 = 1;

/// Configuration for a service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Broker host (e.g. "localhost" or "rabbit:5672"); a full amqp:// URL is used verbatim
    pub host: String,
    /// Topic exchange shared by every service of the application
    pub exchange: String,
    /// Delay before retrying a refused connection, in milliseconds
    pub reconnect_timeout_ms: u64,
    /// Cap on consecutive refused attempts; `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    /// Queue settings used when a subscription does not override them
    pub default_queue: QueueConfig,
    /// Consume settings used when a subscription does not override them
    pub default_consume: ConsumeConfig,
    /// Ack mode used when a subscription does not override it
    pub default_ack: AckMode,
    /// Publish options merged under every send
    pub default_send: PublishOptions,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            reconnect_timeout_ms: 5_000,
            max_reconnect_attempts: None,
            default_queue: QueueConfig::default(),
            default_consume: ConsumeConfig::default(),
            default_ack: AckMode::Auto,
            default_send: PublishOptions::default(),
        }
    }
}

impl ServiceConfig {
    /// Create new service configuration
    pub fn new(host: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            exchange: exchange.into(),
            ..Default::default()
        }
    }

    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_default_queue(mut self, queue: QueueConfig) -> Self {
        self.default_queue = queue;
        self
    }

    pub fn with_default_consume(mut self, consume: ConsumeConfig) -> Self {
        self.default_consume = consume;
        self
    }

    pub fn with_default_ack(mut self, ack: AckMode) -> Self {
        self.default_ack = ack;
        self
    }

    pub fn with_default_send(mut self, send: PublishOptions) -> Self {
        self.default_send = send;
        self
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    /// AMQP URI for the configured host
    pub fn amqp_uri(&self) -> String {
        if self.host.starts_with("amqp://") || self.host.starts_with("amqps://") {
            self.host.clone()
        } else {
            format!("amqp://{}", self.host)
        }
    }
}

/// Queue declaration settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: true,
        }
    }
}

impl QueueConfig {
    /// Settings for point-to-point reply queues
    pub fn reply() -> Self {
        Self {
            durable: true,
            exclusive: true,
            auto_delete: false,
        }
    }
}

/// Consumer settings passed to basic.consume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeConfig {
    /// Let the broker consider deliveries acknowledged on send
    pub no_ack: bool,
    pub exclusive: bool,
}

/// Who acknowledges a delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Dispatcher acks right after decoding, before the handler runs
    #[default]
    Auto,
    /// Handler must call `ack()` or `nack()` itself
    Manual,
}

/// Per-subscription overrides; unset fields fall back to the service defaults
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub queue: Option<QueueConfig>,
    pub consume: Option<ConsumeConfig>,
    pub ack: Option<AckMode>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn consume(mut self, consume: ConsumeConfig) -> Self {
        self.consume = Some(consume);
        self
    }

    pub fn ack(mut self, ack: AckMode) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Shorthand for `ack(AckMode::Manual)`
    pub fn manual_ack(self) -> Self {
        self.ack(AckMode::Manual)
    }
}

/// Per-message publish properties, passed through to the broker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    /// Message TTL in milliseconds
    pub expiration_ms: Option<u64>,
    /// Delivery mode 2 when true, 1 when false
    pub persistent: Option<bool>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub priority: Option<u8>,
    pub headers: BTreeMap<String, String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, topic: impl Into<String>) -> Self {
        self.reply_to = Some(topic.into());
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// AMQP delivery mode derived from the persistence flag
    pub fn delivery_mode(&self) -> Option<u8> {
        self.persistent.map(|p| if p { 2 } else { 1 })
    }

    /// Overlay `self` on `defaults`: set fields win, headers are unioned
    pub fn merged_over(&self, defaults: &PublishOptions) -> PublishOptions {
        let mut headers = defaults.headers.clone();
        headers.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        PublishOptions {
            expiration_ms: self.expiration_ms.or(defaults.expiration_ms),
            persistent: self.persistent.or(defaults.persistent),
            content_type: self.content_type.clone().or_else(|| defaults.content_type.clone()),
            correlation_id: self
                .correlation_id
                .clone()
                .or_else(|| defaults.correlation_id.clone()),
            reply_to: self.reply_to.clone().or_else(|| defaults.reply_to.clone()),
            message_id: self.message_id.clone().or_else(|| defaults.message_id.clone()),
            priority: self.priority.or(defaults.priority),
            headers,
        }
    }
}
