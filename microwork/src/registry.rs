use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{MicroworkError, Result};

/// One live consumer created by `subscribe`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub queue: String,
    pub consumer_tag: String,
}

/// Number of local consumers for a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscribers {
    pub topic: String,
    pub subscribers: usize,
}

/// Tracks the broker consumers owned by one service instance.
///
/// Callers that touch the broker and the registry together take the topic
/// lock first, so broker-side consumers and records change in step.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: RwLock<HashMap<String, Vec<SubscriptionRecord>>>,
    topic_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize registry mutations for one topic
    pub async fn lock_topic(&self, topic: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.topic_locks.lock().await;
            locks.entry(topic.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Release a topic lock, forgetting it once the topic has no records and
    /// nobody else holds or waits for it
    pub async fn unlock_topic(&self, topic: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.topic_locks.lock().await;
        let idle = locks
            .get(topic)
            .map_or(false, |lock| Arc::strong_count(lock) == 1);
        if idle && !self.topics.read().await.contains_key(topic) {
            locks.remove(topic);
        }
    }

    pub async fn add(&self, record: SubscriptionRecord) {
        let mut topics = self.topics.write().await;
        topics.entry(record.topic.clone()).or_default().push(record);
    }

    /// Look up a record without removing it
    pub async fn find(&self, topic: &str, consumer_tag: &str) -> Result<SubscriptionRecord> {
        let topics = self.topics.read().await;
        let records = topics.get(topic).ok_or_else(|| MicroworkError::UnknownTopic {
            topic: topic.to_string(),
        })?;
        records
            .iter()
            .find(|r| r.consumer_tag == consumer_tag)
            .cloned()
            .ok_or_else(|| MicroworkError::UnknownSubscription {
                topic: topic.to_string(),
                consumer_tag: consumer_tag.to_string(),
            })
    }

    pub async fn remove_by_tag(&self, topic: &str, consumer_tag: &str) -> Result<SubscriptionRecord> {
        let mut topics = self.topics.write().await;
        let records = topics.get_mut(topic).ok_or_else(|| MicroworkError::UnknownTopic {
            topic: topic.to_string(),
        })?;
        let index = records
            .iter()
            .position(|r| r.consumer_tag == consumer_tag)
            .ok_or_else(|| MicroworkError::UnknownSubscription {
                topic: topic.to_string(),
                consumer_tag: consumer_tag.to_string(),
            })?;
        let record = records.remove(index);
        if records.is_empty() {
            topics.remove(topic);
        }
        Ok(record)
    }

    /// Remove every record for a topic, deleting its entry
    pub async fn remove_all(&self, topic: &str) -> Result<Vec<SubscriptionRecord>> {
        self.topics
            .write()
            .await
            .remove(topic)
            .ok_or_else(|| MicroworkError::UnknownTopic {
                topic: topic.to_string(),
            })
    }

    /// Drop every record; used once the channel carrying the consumers is gone
    pub async fn clear(&self) -> Vec<SubscriptionRecord> {
        let mut topics = self.topics.write().await;
        topics.drain().flat_map(|(_, records)| records).collect()
    }

    pub async fn records(&self, topic: &str) -> Vec<SubscriptionRecord> {
        let topics = self.topics.read().await;
        topics.get(topic).cloned().unwrap_or_default()
    }

    pub async fn list_topics(&self) -> Vec<String> {
        let topics = self.topics.read().await;
        let mut names: Vec<String> = topics.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn counts(&self) -> Vec<TopicSubscribers> {
        let topics = self.topics.read().await;
        let mut counts: Vec<TopicSubscribers> = topics
            .iter()
            .map(|(topic, records)| TopicSubscribers {
                topic: topic.clone(),
                subscribers: records.len(),
            })
            .collect();
        counts.sort_by(|a, b| a.topic.cmp(&b.topic));
        counts
    }

    /// Total number of records across topics
    pub async fn len(&self) -> usize {
        self.topics.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.topics.read().await.is_empty()
    }

    /// Topics with a live lock entry
    pub async fn locked_topics(&self) -> usize {
        self.topic_locks.lock().await.len()
    }
}
