mod common;

use common::{forward, recv, service};
use futures_util::future::join_all;
use microwork::plugins::{hardwarestat, healthcheck, substats};
use microwork::plugins::{HardwareReport, HardwareStat, HealthCheck, SubscriberReport, SubscriberStats};
use microwork::{
    ConnectOutcome, ConnectionState, Lifecycle, MemoryBroker, MicroService, MicroworkError, Plugin,
    Reporter, ServiceConfig, SubscribeOptions, TopicSubscribers,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn retrying_service(broker: &MemoryBroker, max_attempts: Option<u32>) -> MicroService {
    let mut config = ServiceConfig::new("memory", "test.lifecycle")
        .with_reconnect_timeout(Duration::from_millis(500));
    config.max_reconnect_attempts = max_attempts;
    MicroService::with_connector(config, Arc::new(broker.clone()))
}

#[tokio::test]
async fn stop_drains_subscriptions_and_closes_connection() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.stop");
    for topic in ["test.a", "test.b", "test.b"] {
        let (handler, _rx) = forward();
        service.subscribe_with(topic, handler, SubscribeOptions::default()).await.unwrap();
    }
    assert_eq!(service.registry().len().await, 3);

    service.stop().await.unwrap();
    assert_eq!(service.lifecycle().await, Lifecycle::Closed);
    assert_eq!(service.state(), ConnectionState::Closed);
    assert!(service.registry().is_empty().await);
    assert_eq!(broker.open_connections().await, 0);
    assert_eq!(broker.open_channels().await, 0);
    // Work queues were auto-deleted with their last consumer
    assert!(broker.queue_names().await.is_empty());
}

#[tokio::test]
async fn operations_after_stop_fail() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.closed");
    service.send("test.topic", &1).await.unwrap();
    service.stop().await.unwrap();

    assert!(service.stop().await.is_ok());
    assert!(matches!(service.send("test.topic", &1).await, Err(MicroworkError::Stopped)));
    let err = service.subscribe("test.topic", |_| async { Ok(()) }).await.unwrap_err();
    assert!(matches!(err, MicroworkError::Stopped));
    let err = service.unsubscribe("test.topic", None).await.unwrap_err();
    assert!(matches!(err, MicroworkError::Stopped));
}

#[tokio::test]
async fn stop_without_ever_connecting() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.never");
    service.stop().await.unwrap();
    assert_eq!(broker.connect_attempts(), 0);
    assert_eq!(service.lifecycle().await, Lifecycle::Closed);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_reconnect() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let service = retrying_service(&broker, None);

    assert_eq!(service.connect().await.unwrap(), ConnectOutcome::RetryScheduled);
    assert!(matches!(service.state(), ConnectionState::RetryScheduled { .. }));

    service.stop().await.unwrap();
    assert_eq!(service.state(), ConnectionState::Closed);

    broker.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.open_connections().await, 0);
}

#[tokio::test(start_paused = true)]
async fn send_rides_out_refused_connections() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let service = retrying_service(&broker, None);

    let sender = {
        let service = service.clone();
        tokio::spawn(async move { service.send("test.topic", "eventually").await })
    };
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(!sender.is_finished());
    assert_eq!(broker.connect_attempts(), 3);

    broker.set_reachable(true);
    sender.await.unwrap().unwrap();
    assert_eq!(service.state(), ConnectionState::Connected);
    service.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_releases_callers_waiting_on_a_retry() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let service = retrying_service(&broker, None);

    let sender = {
        let service = service.clone();
        tokio::spawn(async move { service.send("test.topic", &1).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.stop().await.unwrap();

    let result = sender.await.unwrap();
    assert!(matches!(result, Err(MicroworkError::Stopped)));
}

#[tokio::test(start_paused = true)]
async fn capped_retries_surface_exhaustion() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let service = retrying_service(&broker, Some(2));

    let err = service.send("test.topic", &1).await.unwrap_err();
    assert!(matches!(err, MicroworkError::ReconnectExhausted { attempts: 2 }));
    assert_eq!(service.state(), ConnectionState::Exhausted { attempts: 2 });
    let err = service.send("test.topic", &2).await.unwrap_err();
    assert!(matches!(err, MicroworkError::ReconnectExhausted { .. }));
    assert_eq!(broker.connect_attempts(), 2);
    service.stop().await.unwrap();
}

#[tokio::test]
async fn conflicting_exchange_type_is_fatal() {
    let broker = MemoryBroker::new();
    broker.declare_exchange("test.direct", "direct").await;
    let service = service(&broker, "test.direct");

    let err = service.send("test.topic", &1).await.unwrap_err();
    assert!(matches!(err.cause(), MicroworkError::Broker { code: 406, .. }));
    assert_eq!(service.state(), ConnectionState::Disconnected);
    service.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_sends_share_a_fatal_connect_failure() {
    let broker = MemoryBroker::new();
    broker.declare_exchange("test.conflict", "direct").await;
    let service = service(&broker, "test.conflict");

    let values: Vec<i32> = (0..5).collect();
    let results = join_all(values.iter().map(|i| service.send("test.topic", i))).await;
    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err.cause(), MicroworkError::Broker { code: 406, .. }));
    }
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.open_connections().await, 0);
    service.stop().await.unwrap();
}

#[tokio::test]
async fn service_reconnects_after_broker_drops_connection() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.restart");
    let (handler, _rx) = forward();
    service.subscribe_with("test.before", handler, SubscribeOptions::default()).await.unwrap();

    broker.drop_connections().await;
    // The consumer died with the connection, and so does its record
    tokio::time::timeout(Duration::from_secs(2), async {
        while !service.registry().is_empty().await {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    service.send("test.topic", &1).await.unwrap();
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(service.state(), ConnectionState::Connected);

    let (handler, mut rx) = forward();
    service.subscribe_with("test.after", handler, SubscribeOptions::default()).await.unwrap();
    service.send("test.after", "back").await.unwrap();
    assert_eq!(recv(&mut rx).await, json!("back"));

    service.stop().await.unwrap();
    assert_eq!(broker.open_connections().await, 0);
}

#[tokio::test]
async fn stop_after_broker_drops_connection() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.restart.stop");
    let (handler, _rx) = forward();
    service.subscribe_with("test.topic", handler, SubscribeOptions::default()).await.unwrap();

    broker.drop_connections().await;
    service.stop().await.unwrap();
    assert!(service.registry().is_empty().await);
    assert_eq!(broker.connect_attempts(), 1);
}

struct Foo(&'static str);

#[async_trait::async_trait]
impl Plugin for Foo {
    fn name(&self) -> &str {
        "foo"
    }
}

#[tokio::test]
async fn plugins_never_override_existing_members() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.plugins");

    assert!(service.register_plugin(Foo("first")).await);
    assert!(!service.register_plugin(Foo("second")).await);
    assert_eq!(service.plugin::<Foo>().await.unwrap().0, "first");

    let first = HealthCheck::new(&service).with_interval(Duration::from_millis(250));
    assert!(service.register_plugin(first).await);
    assert!(!service.register_plugin(HealthCheck::new(&service)).await);
    let installed = service.plugin::<HealthCheck>().await.unwrap();
    assert_eq!(Reporter::interval(installed.as_ref()), Duration::from_millis(250));

    assert_eq!(service.plugins().names().await, vec!["foo", "health_check"]);
}

#[tokio::test(start_paused = true)]
async fn health_check_autoreports_service_id() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "master.health.autoreport");
    service
        .register_plugin(HealthCheck::new(&service).with_interval(Duration::from_millis(500)))
        .await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    service
        .subscribe(healthcheck::ALIVE_TOPIC, move |delivery| {
            let tx = tx.clone();
            async move {
                let expiration = delivery.metadata().properties.expiration.clone();
                let _ = tx.send((delivery.into_message(), expiration));
                Ok(())
            }
        })
        .await
        .unwrap();

    let health = service.plugin::<HealthCheck>().await.unwrap();
    health.autoreport_health();
    for _ in 0..2 {
        let (id, expiration) = recv(&mut rx).await;
        assert_eq!(id, json!(service.id()));
        assert_eq!(expiration.as_deref(), Some("500"));
    }

    service.stop().await.unwrap();
    assert!(!health.is_autoreporting());
}

#[tokio::test]
async fn subscriber_stats_answer_report_requests() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "master.substats.report");
    service.register_plugin(SubscriberStats::new(&service)).await;

    service.subscribe("test.sub", |_| async { Ok(()) }).await.unwrap();
    service.subscribe("test.other.sub", |_| async { Ok(()) }).await.unwrap();
    service.subscribe("test.other.sub", |_| async { Ok(()) }).await.unwrap();
    let (handler, mut reports) = forward();
    service
        .subscribe_with(substats::SUBSCRIBERS_TOPIC, handler, SubscribeOptions::default())
        .await
        .unwrap();

    let stats = service.plugin::<SubscriberStats>().await.unwrap();
    stats.init_subscribers_reporting().await.unwrap();
    service.send(substats::REPORT_REQUEST_TOPIC, &Value::Null).await.unwrap();

    let report: SubscriberReport = serde_json::from_value(recv(&mut reports).await).unwrap();
    assert_eq!(report.id, service.id());
    let count = |topic: &str| {
        report
            .subscribers
            .iter()
            .find(|s| s.topic == topic)
            .map(|s| s.subscribers)
    };
    assert_eq!(count("test.sub"), Some(1));
    assert_eq!(count("test.other.sub"), Some(2));
    assert!(report.subscribers.contains(&TopicSubscribers {
        topic: substats::REPORT_REQUEST_TOPIC.into(),
        subscribers: 1,
    }));
    service.stop().await.unwrap();
}

#[tokio::test]
async fn hardware_stats_are_published() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "master.hardware.report");
    service.register_plugin(HardwareStat::new(&service)).await;
    let (handler, mut reports) = forward();
    service
        .subscribe_with(hardwarestat::STATUS_TOPIC, handler, SubscribeOptions::default())
        .await
        .unwrap();

    let hardware = service.plugin::<HardwareStat>().await.unwrap();
    hardware.report_hardware_stats().await.unwrap();

    let report: HardwareReport = serde_json::from_value(recv(&mut reports).await).unwrap();
    assert!(report.cpu.cpus > 0);
    assert_eq!(report.mem.used + report.mem.free, report.mem.total);
    service.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_halts_plugin_timers() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "master.hardware.autoreport");
    service
        .register_plugin(HardwareStat::new(&service).with_interval(Duration::from_millis(100)))
        .await;
    let hardware = service.plugin::<HardwareStat>().await.unwrap();
    hardware.autoreport_hardware_stats();
    assert!(hardware.is_autoreporting());

    hardware.stop_autoreport_hardware_stats();
    assert!(!hardware.is_autoreporting());
    hardware.autoreport_hardware_stats();

    service.stop().await.unwrap();
    assert!(!hardware.is_autoreporting());
}
