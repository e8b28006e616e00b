//! Topic routing: queue naming conventions and queue-to-exchange binding.

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::config::{ConsumeConfig, QueueConfig};
use crate::error::{MicroworkError, Result};
use crate::transport::{BrokerChannel, DeliveryStream};

/// Queue shared by every instance subscribed to `topic` (competing consumers)
pub fn work_queue_name(topic: &str) -> String {
    format!("microwork-{}-queue", topic)
}

/// Queue private to one subscription (point-to-point replies)
pub fn reply_queue_name(id: &Uuid) -> String {
    format!("microwork-reply-{}-queue", id)
}

pub fn new_consumer_tag() -> String {
    format!("microwork-ctag-{}", Uuid::new_v4())
}

pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(MicroworkError::InvalidTopic);
    }
    Ok(())
}

/// Topic exchange matching: `*` is exactly one word, `#` is zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => (word == "*" || word == first) && matches_words(rest, key_rest),
            None => false,
        },
    }
}

/// A queue bound to a topic with a live consumer on it
pub struct Binding {
    pub queue: String,
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
}

/// Declare `queue`, bind it to `exchange` under `topic`, and start consuming
pub async fn bind_and_consume(
    channel: &Arc<dyn BrokerChannel>,
    exchange: &str,
    topic: &str,
    queue: &str,
    queue_config: &QueueConfig,
    consume_config: &ConsumeConfig,
) -> Result<Binding> {
    let queue = channel.declare_queue(queue, queue_config).await?;
    channel.bind_queue(&queue, exchange, topic).await?;
    debug!("bound queue {} to {} on {}", queue, topic, exchange);

    let consumer_tag = new_consumer_tag();
    let deliveries = channel.consume(&queue, &consumer_tag, consume_config).await?;
    Ok(Binding {
        queue,
        consumer_tag,
        deliveries,
    })
}
