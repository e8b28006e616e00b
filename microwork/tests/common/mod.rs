#![allow(dead_code)]

use async_trait::async_trait;
use microwork::{Delivery, Handler, MemoryBroker, MicroService, Result, ServiceConfig};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn service(broker: &MemoryBroker, exchange: &str) -> MicroService {
    MicroService::with_connector(ServiceConfig::new("memory", exchange), Arc::new(broker.clone()))
}

/// Forwards every decoded message into a channel
pub struct Forward(pub mpsc::UnboundedSender<Value>);

#[async_trait]
impl Handler for Forward {
    async fn handle(&self, delivery: Delivery) -> Result<()> {
        let _ = self.0.send(delivery.into_message());
        Ok(())
    }

    fn name(&self) -> &str {
        "forward"
    }
}

pub fn forward() -> (Forward, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Forward(tx), rx)
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("handler channel closed")
}

/// Let in-flight deliveries settle, then assert nothing else arrived
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Ok(extra) = rx.try_recv() {
        panic!("unexpected message: {:?}", extra);
    }
}
