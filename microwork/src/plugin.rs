//! Capability host: optional behaviors attached to a running service.
//!
//! A plugin is a named bundle of state and behavior that talks to the
//! service only through its public `send`/`subscribe`/`id` surface. Names are
//! first-come: a registration whose name is already taken, or collides with a
//! core member, is ignored.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::PublishOptions;
use crate::error::{MicroworkError, Result};
use crate::service::{MicroService, WeakService};

/// Members every service owns; plugins can never take these names
pub const CORE_MEMBERS: &[&str] = &["id", "send", "subscribe", "unsubscribe", "stop", "register_plugin"];

/// Shortest period an `AutoReport` timer runs at
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A capability that can be attached to a service
#[async_trait]
pub trait Plugin: Any + Send + Sync {
    /// Unique capability name
    fn name(&self) -> &str;

    /// Called once when the owning service stops
    async fn on_stop(&self) {}
}

/// Something that periodically publishes a payload on a fixed topic
#[async_trait]
pub trait Reporter: Send + Sync {
    fn topic(&self) -> &str;

    /// Report period, also used as the message expiration
    fn interval(&self) -> Duration;

    async fn payload(&self) -> Result<Value>;

    /// Service the report is sent through
    fn service(&self) -> Result<MicroService>;

    async fn report(&self) -> Result<()> {
        let payload = self.payload().await?;
        let options = PublishOptions::new().expiration(self.interval());
        self.service()?.send_with(self.topic(), &payload, options).await
    }
}

/// Produces one snapshot of some statistic
#[async_trait]
pub trait StatCollector: Send + Sync {
    type Stat: Serialize + Send;

    async fn collect(&self) -> Result<Self::Stat>;
}

struct Entry {
    name: String,
    plugin: Arc<dyn Plugin>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Plugins registered on one service, in registration order
#[derive(Default)]
pub struct PluginHost {
    entries: RwLock<Vec<Entry>>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `plugin` unless its name is already owned. Returns whether it was attached.
    pub async fn register<P: Plugin>(&self, plugin: Arc<P>) -> bool {
        let name = plugin.name().to_string();
        if CORE_MEMBERS.contains(&name.as_str()) {
            warn!("plugin {} collides with a core member, ignoring", name);
            return false;
        }

        let mut entries = self.entries.write().await;
        if entries.iter().any(|entry| entry.name == name) {
            debug!("plugin {} already registered, keeping the first one", name);
            return false;
        }

        let any: Arc<dyn Any + Send + Sync> = plugin.clone();
        entries.push(Entry {
            name: name.clone(),
            plugin,
            any,
        });
        debug!("🔌 registered plugin {}", name);
        true
    }

    /// First registered plugin of type `P`
    pub async fn get<P: Plugin>(&self) -> Option<Arc<P>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .find_map(|entry| entry.any.clone().downcast::<P>().ok())
    }

    pub async fn get_named(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.plugin.clone())
    }

    pub async fn names(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        entries.iter().map(|entry| entry.name.clone()).collect()
    }

    /// Notify every plugin that the service is stopping
    pub async fn shutdown(&self) {
        let plugins: Vec<Arc<dyn Plugin>> = {
            let entries = self.entries.read().await;
            entries.iter().map(|entry| entry.plugin.clone()).collect()
        };
        for plugin in plugins {
            plugin.on_stop().await;
        }
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self
            .entries
            .try_read()
            .map(|entries| entries.iter().map(|e| e.name.clone()).collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("PluginHost").field("plugins", &names).finish()
    }
}

/// Periodic timer driving a `Reporter`.
///
/// The first report fires one period after `start`. The task holds only a
/// weak reference to the reporter and exits once the reporter is dropped or
/// its service has stopped.
#[derive(Debug, Default)]
pub struct AutoReport {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)start reporting every `reporter.interval()`, at most once per `MIN_INTERVAL`
    pub fn start<R: Reporter + 'static>(&self, reporter: &Arc<R>) {
        let period = reporter.interval().max(MIN_INTERVAL);
        let weak: Weak<R> = Arc::downgrade(reporter);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(reporter) = weak.upgrade() else {
                    break;
                };
                match reporter.report().await {
                    Ok(()) => debug!("reported on {}", reporter.topic()),
                    Err(MicroworkError::Stopped) => break,
                    Err(e) => warn!("report on {} failed: {}", reporter.topic(), e),
                }
            }
        });

        let previous = self.slot().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.slot().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot().as_ref().is_some_and(|task| !task.is_finished())
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AutoReport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Upgrade a plugin's service handle, failing once the service is gone
pub(crate) fn upgrade(service: &WeakService) -> Result<MicroService> {
    service.upgrade().ok_or(MicroworkError::Stopped)
}
