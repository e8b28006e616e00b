use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{PublishOptions, ServiceConfig, PREFETCH_COUNT};
use crate::error::{MicroworkError, Result};
use crate::transport::{BrokerChannel, BrokerConnection, Connector};

/// Settings the connection manager needs from `ServiceConfig`
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// AMQP URI (e.g. "amqp://localhost")
    pub uri: String,
    /// Topic exchange declared on every connection
    pub exchange: String,
    /// Backoff between refused attempts
    pub reconnect_timeout: Duration,
    /// Cap on consecutive refused attempts; `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
}

impl From<&ServiceConfig> for ConnectionConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            uri: config.amqp_uri(),
            exchange: config.exchange.clone(),
            reconnect_timeout: config.reconnect_timeout(),
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

/// Connection lifecycle of one service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// An attempt is in flight; other callers wait for it
    Connecting,
    Connected,
    /// Broker refused; a retry fires at `deadline`
    RetryScheduled { deadline: Instant },
    /// Retry cap reached
    Exhausted { attempts: u32 },
    /// Torn down by `close()`; terminal
    Closed,
}

/// Result of a single connect step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    RetryScheduled,
}

/// Open connection plus the single channel everything multiplexes over
#[derive(Clone)]
struct Link {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl Link {
    async fn is_open(&self) -> bool {
        self.connection.is_open().await && self.channel.is_open().await
    }
}

struct Shared {
    link: Option<Link>,
    retry: Option<JoinHandle<()>>,
    refused_attempts: u32,
    /// Number of the latest attempt
    generation: u64,
    /// Latest attempt that failed for a reason other than a refusal
    failure: Option<(u64, Arc<MicroworkError>)>,
}

/// Owns the broker connection for one service instance.
///
/// Only one attempt is ever in flight: callers arriving while `Connecting`
/// wait on a state watch instead of dialing again. Refused attempts schedule
/// a retry on a timer owned here, which `close()` cancels.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    shared: Mutex<Shared>,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU64,
    weak_self: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new_cyclic(|weak_self| Self {
            config,
            connector,
            shared: Mutex::new(Shared {
                link: None,
                retry: None,
                refused_attempts: 0,
                generation: 0,
                failure: None,
            }),
            state,
            attempts: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.config.exchange
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Whether the last connection step left the manager connected
    pub fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connected)
    }

    /// Connection attempts started by this manager
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Run one connection step.
    ///
    /// Returns immediately when connected or when a retry is already pending,
    /// waits for an in-flight attempt, and otherwise dials the broker itself.
    /// A connection the broker has dropped is discarded and dialed again.
    pub async fn connect(&self) -> Result<ConnectOutcome> {
        self.step(&mut None).await
    }

    /// Wait until connected, riding out scheduled retries, and return the channel
    pub async fn ensure_connected(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut awaited = None;
        loop {
            let mut changes = self.state.subscribe();
            match self.step(&mut awaited).await? {
                ConnectOutcome::Connected => {
                    if let Some(link) = self.shared.lock().await.link.clone() {
                        return Ok(link.channel);
                    }
                }
                ConnectOutcome::RetryScheduled => {
                    if changes.changed().await.is_err() {
                        return Err(MicroworkError::Stopped);
                    }
                }
            }
        }
    }

    /// `awaited` is the attempt whose outcome the caller waits on; a fatal
    /// failure of that attempt is returned instead of dialing again.
    async fn step(&self, awaited: &mut Option<u64>) -> Result<ConnectOutcome> {
        loop {
            let mut changes = self.state.subscribe();
            let mut shared = self.shared.lock().await;

            if let (Some(generation), Some((failed, cause))) = (*awaited, &shared.failure) {
                if generation == *failed {
                    return Err(MicroworkError::ConnectFailed(cause.clone()));
                }
            }

            let current = self.state.borrow().clone();
            match current {
                ConnectionState::Connected => {
                    if let Some(link) = &shared.link {
                        if link.is_open().await {
                            return Ok(ConnectOutcome::Connected);
                        }
                    }
                    warn!("connection to {} lost, reconnecting", self.config.uri);
                    shared.link = None;
                }
                ConnectionState::RetryScheduled { .. } => {
                    *awaited = Some(shared.generation + 1);
                    return Ok(ConnectOutcome::RetryScheduled);
                }
                ConnectionState::Exhausted { attempts } => {
                    return Err(MicroworkError::ReconnectExhausted { attempts })
                }
                ConnectionState::Closed => return Err(MicroworkError::Stopped),
                ConnectionState::Disconnected => {}
                ConnectionState::Connecting => {
                    *awaited = Some(shared.generation);
                    drop(shared);
                    debug!("connection attempt in flight, waiting");
                    if changes.changed().await.is_err() {
                        return Err(MicroworkError::Stopped);
                    }
                    continue;
                }
            }

            shared.generation += 1;
            let generation = shared.generation;
            self.state.send_replace(ConnectionState::Connecting);
            drop(shared);

            self.attempts.fetch_add(1, Ordering::SeqCst);
            debug!("connecting to {}", self.config.uri);
            let attempt = self.establish().await;
            return self.finish_attempt(generation, attempt).await;
        }
    }

    /// Channel of the current connection, if any
    pub async fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.shared.lock().await.link.as_ref().map(|link| link.channel.clone())
    }

    /// Publish raw bytes to the exchange under `topic`
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, options: &PublishOptions) -> Result<()> {
        let channel = self.ensure_connected().await?;
        channel
            .publish(&self.config.exchange, topic, payload, options)
            .await
    }

    /// Whether a retry timer is pending and nothing was ever connected
    pub async fn retry_pending(&self) -> bool {
        let shared = self.shared.lock().await;
        shared.link.is_none() && shared.retry.is_some()
    }

    /// Cancel any pending retry, then close the channel and the connection
    pub async fn close(&self) -> Result<()> {
        let link = {
            let mut shared = self.shared.lock().await;
            if let Some(retry) = shared.retry.take() {
                debug!("not connected, cancelling scheduled reconnect");
                retry.abort();
            }
            self.state.send_replace(ConnectionState::Closed);
            shared.link.take()
        };

        let Some(link) = link else {
            return Ok(());
        };
        // The connection is closed even when the channel refuses to
        let channel_closed = link.channel.close().await;
        if let Err(e) = &channel_closed {
            warn!("closing channel failed: {}", e);
        }
        link.connection.close().await?;
        info!("connection to {} closed", self.config.uri);
        channel_closed
    }

    async fn establish(&self) -> Result<Link> {
        let connection = self.connector.connect(&self.config.uri).await?;
        debug!("connected to broker");
        let channel = match self.open_channel(&connection).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!("closing half-open connection failed: {}", close_err);
                }
                return Err(e);
            }
        };
        Ok(Link {
            connection,
            channel,
        })
    }

    async fn open_channel(&self, connection: &Arc<dyn BrokerConnection>) -> Result<Arc<dyn BrokerChannel>> {
        let channel = connection.create_channel().await?;
        channel.declare_topic_exchange(&self.config.exchange).await?;
        channel.set_prefetch(PREFETCH_COUNT).await?;
        debug!("exchange {} declared, prefetch set", self.config.exchange);
        Ok(channel)
    }

    async fn finish_attempt(&self, generation: u64, attempt: Result<Link>) -> Result<ConnectOutcome> {
        let mut shared = self.shared.lock().await;

        if matches!(*self.state.borrow(), ConnectionState::Closed) {
            drop(shared);
            if let Ok(link) = attempt {
                // Closed while dialing; do not leak the fresh connection
                let _ = link.channel.close().await;
                let _ = link.connection.close().await;
            }
            return Err(MicroworkError::Stopped);
        }

        match attempt {
            Ok(link) => {
                shared.link = Some(link);
                shared.refused_attempts = 0;
                self.state.send_replace(ConnectionState::Connected);
                info!("✅ connected to {}", self.config.uri);
                Ok(ConnectOutcome::Connected)
            }
            Err(e) if e.is_connection_refused() => {
                shared.refused_attempts += 1;
                let attempts = shared.refused_attempts;

                if let Some(max) = self.config.max_reconnect_attempts {
                    if attempts >= max {
                        error!("giving up on {} after {} refused attempts", self.config.uri, attempts);
                        self.state.send_replace(ConnectionState::Exhausted { attempts });
                        return Err(MicroworkError::ReconnectExhausted { attempts });
                    }
                }

                let delay = self.config.reconnect_timeout;
                info!(
                    "Couldn't connect to broker, retrying in {}s...",
                    delay.as_secs_f64()
                );
                shared.retry = Some(self.schedule_retry(delay));
                self.state.send_replace(ConnectionState::RetryScheduled {
                    deadline: Instant::now() + delay,
                });
                Ok(ConnectOutcome::RetryScheduled)
            }
            Err(e) => {
                error!("Error connecting: {}", e);
                let cause = Arc::new(e);
                shared.failure = Some((generation, cause.clone()));
                self.state.send_replace(ConnectionState::Disconnected);
                Err(MicroworkError::ConnectFailed(cause))
            }
        }
    }

    fn schedule_retry(&self, delay: Duration) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            {
                let mut shared = manager.shared.lock().await;
                if !matches!(*manager.state.borrow(), ConnectionState::RetryScheduled { .. }) {
                    return;
                }
                // From here the attempt runs to completion; close() only observes it
                shared.retry = None;
                manager.state.send_replace(ConnectionState::Disconnected);
            }
            if let Err(e) = manager.connect().await {
                warn!("reconnect attempt failed: {}", e);
            }
        })
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Connection snapshot for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub is_connected: bool,
    pub attempts: u64,
    pub exchange: String,
}

impl ConnectionManager {
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            is_connected: self.is_connected(),
            attempts: self.attempts(),
            exchange: self.config.exchange.clone(),
        }
    }
}
