use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::plugin::{upgrade, Plugin, Reporter, StatCollector};
use crate::registry::TopicSubscribers;
use crate::service::{MicroService, WeakService};

/// Topic subscriber reports are published on
pub const SUBSCRIBERS_TOPIC: &str = "microwork.node.subscribers";

/// Any message on this topic asks every listening node for a report
pub const REPORT_REQUEST_TOPIC: &str = "microwork.node.report.subscribers";

pub const STATS_EXPIRATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberReport {
    pub id: String,
    pub subscribers: Vec<TopicSubscribers>,
}

/// Reports how many local consumers the service has per topic
#[derive(Debug)]
pub struct SubscriberStats {
    service: WeakService,
}

impl SubscriberStats {
    pub fn new(service: &MicroService) -> Self {
        Self {
            service: service.downgrade(),
        }
    }

    /// Publish the current subscriber report
    pub async fn report_subscribers(&self) -> Result<()> {
        self.report().await
    }

    /// Answer every request on `microwork.node.report.subscribers` with a report.
    /// Returns the consumer tag of the request listener.
    pub async fn init_subscribers_reporting(self: &Arc<Self>) -> Result<String> {
        let weak = Arc::downgrade(self);
        self.service()?
            .subscribe(REPORT_REQUEST_TOPIC, move |_| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(stats) => stats.report_subscribers().await,
                        None => {
                            debug!("subscriber stats plugin dropped, ignoring report request");
                            Ok(())
                        }
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl Plugin for SubscriberStats {
    fn name(&self) -> &str {
        "subscriber_stats"
    }
}

#[async_trait]
impl StatCollector for SubscriberStats {
    type Stat = SubscriberReport;

    async fn collect(&self) -> Result<SubscriberReport> {
        let service = self.service()?;
        Ok(SubscriberReport {
            id: service.id().to_string(),
            subscribers: service.subscriptions().await,
        })
    }
}

#[async_trait]
impl Reporter for SubscriberStats {
    fn topic(&self) -> &str {
        SUBSCRIBERS_TOPIC
    }

    fn interval(&self) -> Duration {
        STATS_EXPIRATION
    }

    async fn payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.collect().await?)?)
    }

    fn service(&self) -> Result<MicroService> {
        upgrade(&self.service)
    }
}
