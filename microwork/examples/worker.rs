//! Work-queue example: run several copies and the broker spreads jobs across them.
//!
//! ```text
//! RABBITMQ_HOST=localhost cargo run --example worker
//! ```

use microwork::plugins::HealthCheck;
use microwork::{logging, Delivery, MicroService, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize)]
struct ResizeJob {
    image: String,
    width: u32,
}

#[derive(Debug, Serialize)]
struct ResizeDone {
    image: String,
    worker: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();

    let host = std::env::var("RABBITMQ_HOST").unwrap_or_else(|_| "localhost".to_string());
    let service = MicroService::new(ServiceConfig::new(host, "microwork.example.exchange"));

    service
        .register_plugin(HealthCheck::new(&service).with_interval(Duration::from_secs(10)))
        .await;
    if let Some(health) = service.plugin::<HealthCheck>().await {
        health.autoreport_health();
    }

    let worker = service.id().to_string();
    service
        .subscribe("image.resize", move |delivery: Delivery| {
            let worker = worker.clone();
            async move {
                let job: ResizeJob = delivery.decode()?;
                info!("resizing {} to {}px", job.image, job.width);
                tokio::time::sleep(Duration::from_millis(200)).await;
                let done = ResizeDone {
                    image: job.image,
                    worker,
                };
                delivery.reply().send("image.resize.response", &done).await
            }
        })
        .await?;

    info!("worker {} ready, press ctrl-c to stop", service.id());
    tokio::signal::ctrl_c().await?;
    service.stop().await?;
    Ok(())
}
