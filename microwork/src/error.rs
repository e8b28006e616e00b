use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for Microwork operations
pub type Result<T> = std::result::Result<T, MicroworkError>;

/// Error types surfaced by a Microwork service
#[derive(Error, Debug)]
pub enum MicroworkError {
    /// Broker could not be reached; retried automatically by the connection manager
    #[error("connection to {host} refused")]
    ConnectionRefused { host: String },

    /// AMQP connection or channel errors
    #[error("AMQP connection error: {0}")]
    Connection(#[from] lapin::Error),

    /// Broker-side rejection reported by a non-AMQP transport
    #[error("broker error {code}: {reason}")]
    Broker { code: u16, reason: String },

    /// Payload encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Empty routing key passed to publish/subscribe
    #[error("topic must not be empty")]
    InvalidTopic,

    /// Unsubscribe from a topic this instance never subscribed to
    #[error("no subscriptions for topic '{topic}'")]
    UnknownTopic { topic: String },

    /// Unsubscribe with a consumer tag that is not registered for the topic
    #[error("no subscription with consumer tag '{consumer_tag}' for topic '{topic}'")]
    UnknownSubscription { topic: String, consumer_tag: String },

    /// Delivery was already acked or nacked
    #[error("delivery already settled")]
    AlreadySettled,

    /// Manual ack/nack on a delivery the dispatcher or broker already acknowledged
    #[error("delivery is acknowledged automatically for this subscription")]
    AutoAcknowledged,

    /// Reconnect attempts hit the configured cap
    #[error("gave up reconnecting after {attempts} refused attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Fatal failure of a connection attempt, shared by every caller waiting on it
    #[error("connection attempt failed: {0}")]
    ConnectFailed(Arc<MicroworkError>),

    /// Operation on a service that has been stopped
    #[error("service is stopped")]
    Stopped,

    /// Errors returned by application handlers
    #[error("Handler error: {0}")]
    Handler(String),
}

impl MicroworkError {
    /// Create a new handler error
    pub fn handler_error<T: ToString>(message: T) -> Self {
        Self::Handler(message.to_string())
    }

    /// The underlying error of a shared connection failure, or `self`
    pub fn cause(&self) -> &MicroworkError {
        match self {
            Self::ConnectFailed(cause) => cause.cause(),
            other => other,
        }
    }

    /// Whether the broker refused the TCP connection
    pub fn is_connection_refused(&self) -> bool {
        match self {
            Self::ConnectionRefused { .. } => true,
            Self::Connection(lapin::Error::IOError(e)) => {
                e.kind() == io::ErrorKind::ConnectionRefused
            }
            _ => false,
        }
    }
}
