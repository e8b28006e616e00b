//! # Microwork - Microservices over an AMQP topic exchange
//!
//! Microwork lets independent services exchange JSON messages on named topics
//! without each of them re-implementing connection management, queue binding
//! or delivery acknowledgement. Services subscribing to the same topic share a
//! work queue, so the broker spreads messages across them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use microwork::{MicroService, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = MicroService::new(ServiceConfig::new("localhost", "my.exchange"));
//!
//!     service.subscribe("math.add", |delivery| async move {
//!         let (a, b): (i64, i64) = delivery.decode()?;
//!         delivery.reply().send("math.add.response", &(a + b)).await
//!     }).await?;
//!
//!     service.send("math.add", &(2, 3)).await?;
//!     service.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod plugins;
pub mod publish;
pub mod registry;
pub mod router;
pub mod service;
pub mod transport;

pub use config::{AckMode, ConsumeConfig, PublishOptions, QueueConfig, ServiceConfig, SubscribeOptions};
pub use connection::{ConnectOutcome, ConnectionManager, ConnectionState, ConnectionStats};
pub use dispatcher::{Delivery, FunctionHandler, Handler};
pub use plugin::{AutoReport, Plugin, PluginHost, Reporter, StatCollector};
pub use publish::{Publisher, Reply};
pub use registry::{SubscriptionRecord, SubscriptionRegistry, TopicSubscribers};
pub use service::{Lifecycle, MicroService, ServiceStats, WeakService};
pub use transport::{DeliveryMetadata, MessageProperties};
#[cfg(any(test, feature = "test-util"))]
pub use transport::MemoryBroker;

// Convenient alias for the main service
pub use service::MicroService as Service;
pub use error::{MicroworkError, Result};
