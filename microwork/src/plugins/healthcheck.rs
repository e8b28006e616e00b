use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::Period;
use crate::error::Result;
use crate::plugin::{upgrade, AutoReport, Plugin, Reporter};
use crate::service::{MicroService, WeakService};

/// Topic keep-alive pings are published on
pub const ALIVE_TOPIC: &str = "microwork.node.alive";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Publishes the service id on `microwork.node.alive`.
///
/// Each ping expires after one interval, so a missing ping means the node is
/// gone.
#[derive(Debug)]
pub struct HealthCheck {
    service: WeakService,
    interval: Period,
    autoreport: AutoReport,
}

impl HealthCheck {
    pub fn new(service: &MicroService) -> Self {
        Self {
            service: service.downgrade(),
            interval: Period::new(DEFAULT_INTERVAL),
            autoreport: AutoReport::new(),
        }
    }

    pub fn with_interval(self, interval: Duration) -> Self {
        self.interval.set(interval);
        self
    }

    /// Takes effect on the next `autoreport_health`
    pub fn set_interval(&self, interval: Duration) {
        self.interval.set(interval);
    }

    /// Send one keep-alive message
    pub async fn report_health(&self) -> Result<()> {
        self.report().await
    }

    /// Send a keep-alive every interval until stopped
    pub fn autoreport_health(self: &Arc<Self>) {
        self.autoreport.start(self);
    }

    pub fn stop_autoreport_health(&self) {
        self.autoreport.stop();
    }

    pub fn is_autoreporting(&self) -> bool {
        self.autoreport.is_running()
    }
}

#[async_trait]
impl Plugin for HealthCheck {
    fn name(&self) -> &str {
        "health_check"
    }

    async fn on_stop(&self) {
        self.stop_autoreport_health();
    }
}

#[async_trait]
impl Reporter for HealthCheck {
    fn topic(&self) -> &str {
        ALIVE_TOPIC
    }

    fn interval(&self) -> Duration {
        self.interval.get()
    }

    async fn payload(&self) -> Result<Value> {
        Ok(Value::String(self.service()?.id().to_string()))
    }

    fn service(&self) -> Result<MicroService> {
        upgrade(&self.service)
    }
}
