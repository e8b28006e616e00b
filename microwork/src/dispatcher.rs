use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument, Span};

use crate::codec;
use crate::config::{AckMode, ConsumeConfig};
use crate::error::{MicroworkError, Result};
use crate::publish::Reply;
use crate::transport::{Acknowledge, DeliveryMetadata, DeliveryStream, RawDelivery};

/// Trait for implementing subscription handlers
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one decoded delivery
    async fn handle(&self, delivery: Delivery) -> Result<()>;

    /// Get handler name for debugging
    fn name(&self) -> &str {
        "Handler"
    }
}

/// Simple function-based handler
pub struct FunctionHandler<F> {
    name: String,
    handler: F,
}

impl<F> FunctionHandler<F> {
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> Handler for FunctionHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, delivery: Delivery) -> Result<()> {
        (self.handler)(delivery).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Who settles deliveries for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Consumed with `no_ack`; the broker never expects a settlement
    Broker,
    /// Dispatcher acks after decoding, before the handler runs
    Dispatcher,
    /// Handler calls `ack()`/`nack()`
    Handler,
}

impl Settlement {
    pub fn resolve(consume: &ConsumeConfig, ack: AckMode) -> Self {
        if consume.no_ack {
            return Self::Broker;
        }
        match ack {
            AckMode::Auto => Self::Dispatcher,
            AckMode::Manual => Self::Handler,
        }
    }
}

/// Settles one delivery at most once
#[derive(Clone)]
struct Acknowledger {
    acker: Arc<dyn Acknowledge>,
    settled: Arc<AtomicBool>,
    settlement: Settlement,
}

impl Acknowledger {
    fn new(acker: Arc<dyn Acknowledge>, settlement: Settlement) -> Self {
        Self {
            acker,
            settled: Arc::new(AtomicBool::new(false)),
            settlement,
        }
    }

    fn claim(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    async fn manual(&self, outcome: Option<bool>) -> Result<()> {
        if self.settlement != Settlement::Handler {
            return Err(MicroworkError::AutoAcknowledged);
        }
        if !self.claim() {
            return Err(MicroworkError::AlreadySettled);
        }
        match outcome {
            None => self.acker.ack().await,
            Some(requeue) => self.acker.nack(requeue).await,
        }
    }

    async fn auto_ack(&self) -> Result<()> {
        if self.settlement == Settlement::Dispatcher && self.claim() {
            self.acker.ack().await?;
        }
        Ok(())
    }

    /// Drop a delivery that will never reach the handler
    async fn discard(&self) -> Result<()> {
        if !self.claim() {
            return Ok(());
        }
        match self.settlement {
            Settlement::Broker => Ok(()),
            Settlement::Dispatcher => self.acker.ack().await,
            Settlement::Handler => self.acker.nack(false).await,
        }
    }

    async fn requeue_unsettled(&self) -> Result<()> {
        if self.settlement == Settlement::Handler && self.claim() {
            self.acker.nack(true).await?;
        }
        Ok(())
    }
}

/// A decoded message plus the capabilities a handler gets with it
pub struct Delivery {
    message: Value,
    metadata: DeliveryMetadata,
    reply: Reply,
    acknowledger: Acknowledger,
}

impl Delivery {
    /// Decoded payload
    pub fn message(&self) -> &Value {
        &self.message
    }

    pub fn into_message(self) -> Value {
        self.message
    }

    /// Deserialize the payload to a specific type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        codec::from_value(&self.message)
    }

    pub fn metadata(&self) -> &DeliveryMetadata {
        &self.metadata
    }

    /// Routing key the message was published with
    pub fn topic(&self) -> &str {
        &self.metadata.routing_key
    }

    /// Publisher for answering on another topic
    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    /// Acknowledge this delivery (manual ack subscriptions only)
    pub async fn ack(&self) -> Result<()> {
        self.acknowledger.manual(None).await
    }

    /// Reject this delivery and ask the broker to redeliver it
    pub async fn nack(&self) -> Result<()> {
        self.acknowledger.manual(Some(true)).await
    }

    /// Reject this delivery without requeueing it
    pub async fn reject(&self) -> Result<()> {
        self.acknowledger.manual(Some(false)).await
    }

    pub fn is_settled(&self) -> bool {
        self.acknowledger.settled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("metadata", &self.metadata)
            .field("settlement", &self.acknowledger.settlement)
            .finish()
    }
}

/// Drives one consumer: decode, settle per policy, invoke the handler
pub(crate) struct Dispatcher {
    handler: Arc<dyn Handler>,
    reply: Reply,
    settlement: Settlement,
}

impl Dispatcher {
    pub(crate) fn new(handler: Arc<dyn Handler>, reply: Reply, settlement: Settlement) -> Self {
        Self {
            handler,
            reply,
            settlement,
        }
    }

    /// Consume until the stream ends (consumer cancelled or channel closed)
    pub(crate) fn spawn(self, mut deliveries: DeliveryStream, span: Span) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                debug!("consuming with handler {}", self.handler.name());
                while let Some(next) = deliveries.next().await {
                    match next {
                        Ok(raw) => self.dispatch(raw).await,
                        Err(e) => error!("Error receiving message: {}", e),
                    }
                }
                debug!("consumer stopped");
            }
            .instrument(span),
        )
    }

    pub(crate) async fn dispatch(&self, raw: RawDelivery) {
        let RawDelivery {
            data,
            metadata,
            acker,
        } = raw;
        let delivery_tag = metadata.delivery_tag;
        let acknowledger = Acknowledger::new(acker, self.settlement);

        if data.is_empty() {
            debug!(delivery_tag, "empty delivery treated as cancel signal");
            if let Err(e) = acknowledger.discard().await {
                warn!(delivery_tag, "failed to discard empty delivery: {}", e);
            }
            return;
        }

        let message = match codec::decode(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!(delivery_tag, "dropping malformed payload: {}", e);
                if let Err(e) = acknowledger.discard().await {
                    warn!(delivery_tag, "failed to discard malformed delivery: {}", e);
                }
                return;
            }
        };

        if let Err(e) = acknowledger.auto_ack().await {
            error!(delivery_tag, "Failed to acknowledge message: {}", e);
        }

        let delivery = Delivery {
            message,
            metadata,
            reply: self.reply.clone(),
            acknowledger: acknowledger.clone(),
        };

        let outcome = AssertUnwindSafe(self.handler.handle(delivery))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "handler panicked".to_string(),
        };

        error!(delivery_tag, "❌ handler {} failed: {}", self.handler.name(), failure);
        if let Err(e) = acknowledger.requeue_unsettled().await {
            error!(delivery_tag, "failed to requeue delivery: {}", e);
        }
    }
}
