use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::codec;
use crate::config::PublishOptions;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::router::validate_topic;

/// Publishes JSON payloads to the service's exchange.
///
/// Cheap to clone; handlers receive one as their `reply` capability, so a
/// consumer can answer on any topic without the core tracking correlation.
#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    defaults: PublishOptions,
}

/// The publisher handed to handlers
pub type Reply = Publisher;

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>, defaults: PublishOptions) -> Self {
        Self {
            connection,
            defaults,
        }
    }

    /// Send `data` to `topic` with the default publish options
    pub async fn send<T: Serialize + ?Sized>(&self, topic: &str, data: &T) -> Result<()> {
        self.send_with(topic, data, PublishOptions::default()).await
    }

    /// Send with per-message options merged over the defaults
    pub async fn send_with<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        data: &T,
        options: PublishOptions,
    ) -> Result<()> {
        validate_topic(topic)?;
        let payload = codec::encode(data)?;
        let options = options.merged_over(&self.defaults);
        debug!("sending to {} ({} bytes)", topic, payload.len());
        self.connection.publish(topic, payload, &options).await
    }
}
