mod common;

use common::{assert_quiet, forward, recv, service};
use futures_util::future::join_all;
use microwork::transport::{BrokerChannel, BrokerConnection, Connector};
use microwork::{
    Delivery, MemoryBroker, MicroworkError, PublishOptions, SubscribeOptions, TopicSubscribers,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

#[tokio::test]
async fn round_trip_preserves_payload() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.roundtrip");
    let (handler, mut rx) = forward();
    service
        .subscribe_with("test.request", handler, SubscribeOptions::default())
        .await
        .unwrap();

    let payloads = [
        json!({"hello": "world", "nested": {"list": [1, 2.5, "three"], "ok": true}, "nothing": null}),
        json!("plain string"),
        json!(42),
        json!([]),
    ];
    for payload in &payloads {
        service.send("test.request", payload).await.unwrap();
        assert_eq!(&recv(&mut rx).await, payload);
    }
    service.stop().await.unwrap();
}

#[tokio::test]
async fn handler_replies_on_response_topic() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.ping");

    service
        .subscribe("test.request", |delivery: Delivery| async move {
            if delivery.message() == "ping" {
                delivery.reply().send("test.request.response", "pong").await?;
            }
            Ok(())
        })
        .await
        .unwrap();
    let (handler, mut responses) = forward();
    service
        .subscribe_with("test.request.response", handler, SubscribeOptions::default())
        .await
        .unwrap();

    service.send("test.request", "ping").await.unwrap();
    assert_eq!(recv(&mut responses).await, json!("pong"));
    assert_quiet(&mut responses).await;
    service.stop().await.unwrap();
}

#[tokio::test]
async fn instances_compete_for_a_work_queue() {
    let broker = MemoryBroker::new();
    let mut receivers = Vec::new();
    let mut services = Vec::new();
    for _ in 0..3 {
        let service = service(&broker, "test.roundrobin");
        let (handler, rx) = forward();
        service
            .subscribe_with("test.work", handler, SubscribeOptions::default())
            .await
            .unwrap();
        services.push(service);
        receivers.push(rx);
    }
    assert_eq!(broker.consumer_count("microwork-test.work-queue").await, Some(3));

    let sent: HashSet<String> = ["one", "two", "three"].iter().map(|s| s.to_string()).collect();
    for message in &sent {
        services[0].send("test.work", message).await.unwrap();
    }

    let mut received = HashSet::new();
    for rx in receivers.iter_mut() {
        let message = recv(rx).await;
        received.insert(message.as_str().unwrap().to_string());
    }
    assert_eq!(received, sent);
    for rx in receivers.iter_mut() {
        assert_quiet(rx).await;
    }

    for service in services {
        service.stop().await.unwrap();
    }
}

#[tokio::test]
async fn unsubscribe_by_tag_leaves_sibling_running() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.unsubscribe");
    let (first, mut first_rx) = forward();
    let (second, mut second_rx) = forward();
    service
        .subscribe_with("test.topic", first, SubscribeOptions::default())
        .await
        .unwrap();
    let second_tag = service
        .subscribe_with("test.topic", second, SubscribeOptions::default())
        .await
        .unwrap();

    service.send("test.topic", &1).await.unwrap();
    service.send("test.topic", &2).await.unwrap();
    assert_eq!(recv(&mut first_rx).await, json!(1));
    assert_eq!(recv(&mut second_rx).await, json!(2));

    service.unsubscribe("test.topic", Some(&second_tag)).await.unwrap();
    assert_eq!(
        service.subscriptions().await,
        vec![TopicSubscribers { topic: "test.topic".into(), subscribers: 1 }]
    );

    service.send("test.topic", &3).await.unwrap();
    service.send("test.topic", &4).await.unwrap();
    assert_eq!(recv(&mut first_rx).await, json!(3));
    assert_eq!(recv(&mut first_rx).await, json!(4));
    // The cancelled consumer's task ends and drops its handler
    let closed = tokio::time::timeout(Duration::from_secs(2), second_rx.recv()).await.unwrap();
    assert_eq!(closed, None);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_topic_removes_every_consumer() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.unsubscribe.all");
    let (first, _first_rx) = forward();
    let (second, _second_rx) = forward();
    service.subscribe_with("test.topic", first, SubscribeOptions::default()).await.unwrap();
    service.subscribe_with("test.topic", second, SubscribeOptions::default()).await.unwrap();
    let (other, mut other_rx) = forward();
    service.subscribe_with("test.other", other, SubscribeOptions::default()).await.unwrap();

    service.unsubscribe("test.topic", None).await.unwrap();
    assert_eq!(service.registry().list_topics().await, vec!["test.other"]);
    assert_eq!(broker.consumer_count("microwork-test.topic-queue").await, None);

    service.send("test.other", "still here").await.unwrap();
    assert_eq!(recv(&mut other_rx).await, json!("still here"));
    service.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_unsubscribe_is_an_error() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.unknown");
    let (handler, mut rx) = forward();
    service.subscribe_with("test.topic", handler, SubscribeOptions::default()).await.unwrap();

    let err = service.unsubscribe("test.nope", None).await.unwrap_err();
    assert!(matches!(err, MicroworkError::UnknownTopic { .. }));
    let err = service.unsubscribe("test.topic", Some("bogus-tag")).await.unwrap_err();
    assert!(matches!(err, MicroworkError::UnknownSubscription { .. }));

    service.send("test.topic", &true).await.unwrap();
    assert_eq!(recv(&mut rx).await, json!(true));
    service.stop().await.unwrap();
}

#[tokio::test]
async fn manual_nack_redelivers_and_ack_settles() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.manual");
    let (tx, mut rx) = mpsc::unbounded_channel();

    service
        .subscribe_with(
            "test.manual",
            microwork::FunctionHandler::new("manual", move |delivery: Delivery| {
                let tx = tx.clone();
                async move {
                    let redelivered = delivery.metadata().redelivered;
                    let _ = tx.send((delivery.message().clone(), redelivered));
                    if redelivered {
                        delivery.ack().await
                    } else {
                        delivery.nack().await
                    }
                }
            }),
            SubscribeOptions::new().manual_ack(),
        )
        .await
        .unwrap();

    service.send("test.manual", "job").await.unwrap();
    assert_eq!(recv(&mut rx).await, (json!("job"), false));
    assert_eq!(recv(&mut rx).await, (json!("job"), true));
    assert_quiet(&mut rx).await;
    assert_eq!(broker.message_count("microwork-test.manual-queue").await, Some(0));
    service.stop().await.unwrap();
}

#[tokio::test]
async fn nacked_message_moves_to_competing_consumer() {
    let broker = MemoryBroker::new();
    let rejecting = service(&broker, "test.nack");
    let accepting = service(&broker, "test.nack");

    rejecting
        .subscribe_with(
            "test.job",
            microwork::FunctionHandler::new("reject", |delivery: Delivery| async move {
                delivery.nack().await
            }),
            SubscribeOptions::new().manual_ack(),
        )
        .await
        .unwrap();
    let (handler, mut rx) = forward();
    accepting
        .subscribe_with("test.job", handler, SubscribeOptions::default())
        .await
        .unwrap();

    // Round robin hands the first message to the rejecting instance
    rejecting.send("test.job", "work").await.unwrap();
    assert_eq!(recv(&mut rx).await, json!("work"));

    rejecting.stop().await.unwrap();
    accepting.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_payload_is_dropped_without_stopping_consumer() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.malformed");
    let (handler, mut rx) = forward();
    service.subscribe_with("test.topic", handler, SubscribeOptions::default()).await.unwrap();

    let connection = broker.connect("amqp://memory").await.unwrap();
    let channel = connection.create_channel().await.unwrap();
    let options = PublishOptions::default();
    channel
        .publish("test.malformed", "test.topic", b"{not json".to_vec(), &options)
        .await
        .unwrap();
    channel
        .publish("test.malformed", "test.topic", Vec::new(), &options)
        .await
        .unwrap();

    service.send("test.topic", &json!({"valid": true})).await.unwrap();
    assert_eq!(recv(&mut rx).await, json!({"valid": true}));
    assert_quiet(&mut rx).await;
    assert_eq!(broker.message_count("microwork-test.topic-queue").await, Some(0));

    connection.close().await.unwrap();
    service.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_payload_is_rejected_in_manual_mode() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.malformed.manual");
    let (handler, mut rx) = forward();
    service
        .subscribe_with("test.topic", handler, SubscribeOptions::new().manual_ack())
        .await
        .unwrap();

    let connection = broker.connect("amqp://memory").await.unwrap();
    let channel = connection.create_channel().await.unwrap();
    channel
        .publish("test.malformed.manual", "test.topic", b"<xml/>".to_vec(), &PublishOptions::default())
        .await
        .unwrap();

    assert_quiet(&mut rx).await;
    // Rejected without requeue, so it is gone rather than looping
    assert_eq!(broker.message_count("microwork-test.topic-queue").await, Some(0));
    connection.close().await.unwrap();
    service.stop().await.unwrap();
}

#[tokio::test]
async fn send_before_subscribe_is_not_delivered() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.early");

    service.send("test.topic", &json!({"hello": "world"})).await.unwrap();
    let (handler, mut rx) = forward();
    service.subscribe_with("test.topic", handler, SubscribeOptions::default()).await.unwrap();
    service.send("test.topic", &json!({"hello": "again"})).await.unwrap();

    assert_eq!(recv(&mut rx).await, json!({"hello": "again"}));
    assert_quiet(&mut rx).await;
    service.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_sends_share_one_connection_attempt() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.coalesce");

    let values: Vec<i32> = (0..10).collect();
    let results = join_all(values.iter().map(|i| service.send("test.topic", i))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.open_connections().await, 1);
    service.stop().await.unwrap();
}

#[tokio::test]
async fn handler_sees_delivery_metadata() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.metadata");
    let (tx, mut rx) = mpsc::unbounded_channel();
    service
        .subscribe("test.topic", move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(delivery.metadata().clone());
                Ok(())
            }
        })
        .await
        .unwrap();

    let options = PublishOptions::new()
        .persistent(true)
        .expiration(Duration::from_secs(1))
        .correlation_id("req-1")
        .header("origin", "test");
    service.send_with("test.topic", &"hi", options).await.unwrap();

    let metadata = recv(&mut rx).await;
    assert_eq!(metadata.exchange, "test.metadata");
    assert_eq!(metadata.routing_key, "test.topic");
    assert!(!metadata.redelivered);
    assert_eq!(metadata.properties.delivery_mode, Some(2));
    assert_eq!(metadata.properties.expiration.as_deref(), Some("1000"));
    assert_eq!(metadata.properties.correlation_id.as_deref(), Some("req-1"));
    assert_eq!(metadata.properties.headers.get("origin").map(String::as_str), Some("test"));
    service.stop().await.unwrap();
}

#[tokio::test]
async fn reply_queue_subscribers_each_get_a_copy() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.reply");
    let mut receivers = Vec::new();
    for _ in 0..2 {
        let (tx, rx) = mpsc::unbounded_channel::<Value>();
        service
            .subscribe_reply("test.broadcast", move |delivery: Delivery| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(delivery.into_message());
                    Ok(())
                }
            })
            .await
            .unwrap();
        receivers.push(rx);
    }

    service.send("test.broadcast", "everyone").await.unwrap();
    for rx in receivers.iter_mut() {
        assert_eq!(recv(rx).await, json!("everyone"));
    }
    service.stop().await.unwrap();
    assert!(broker.queue_names().await.is_empty());
}

#[tokio::test]
async fn busy_consumer_is_skipped_for_an_idle_peer() {
    let broker = MemoryBroker::new();
    let busy = service(&broker, "test.fair");
    let idle = service(&broker, "test.fair");
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());

    let gate = release.clone();
    busy.subscribe_with(
        "test.fair",
        microwork::FunctionHandler::new("busy", move |delivery: Delivery| {
            let started_tx = started_tx.clone();
            let gate = gate.clone();
            async move {
                let _ = started_tx.send(delivery.message().clone());
                gate.notified().await;
                delivery.ack().await
            }
        }),
        SubscribeOptions::new().manual_ack(),
    )
    .await
    .unwrap();
    let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
    idle.subscribe_with(
        "test.fair",
        microwork::FunctionHandler::new("idle", move |delivery: Delivery| {
            let idle_tx = idle_tx.clone();
            async move {
                let _ = idle_tx.send(delivery.message().clone());
                delivery.ack().await
            }
        }),
        SubscribeOptions::new().manual_ack(),
    )
    .await
    .unwrap();

    busy.send("test.fair", &1).await.unwrap();
    assert_eq!(recv(&mut started).await, json!(1));

    // Round robin alone would hand every other message to the busy instance
    for i in 2..=4 {
        busy.send("test.fair", &i).await.unwrap();
    }
    for i in 2..=4 {
        assert_eq!(recv(&mut idle_rx).await, json!(i));
    }
    assert_quiet(&mut started).await;

    release.notify_one();
    busy.stop().await.unwrap();
    idle.stop().await.unwrap();
}

#[tokio::test]
async fn in_flight_handler_finishes_after_unsubscribe() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "test.inflight");
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let (settled_tx, mut settled) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());

    let gate = release.clone();
    let slow_tag = service
        .subscribe_with(
            "test.slow",
            microwork::FunctionHandler::new("slow", move |delivery: Delivery| {
                let started_tx = started_tx.clone();
                let settled_tx = settled_tx.clone();
                let gate = gate.clone();
                async move {
                    let _ = started_tx.send(delivery.message().clone());
                    gate.notified().await;
                    let acked = delivery.ack().await;
                    let _ = settled_tx.send(acked.is_ok());
                    Ok(())
                }
            }),
            SubscribeOptions::new().manual_ack(),
        )
        .await
        .unwrap();
    let (handler, mut sibling_rx) = forward();
    service
        .subscribe_with("test.slow", handler, SubscribeOptions::new().manual_ack())
        .await
        .unwrap();

    service.send("test.slow", "job").await.unwrap();
    assert_eq!(recv(&mut started).await, json!("job"));

    service.unsubscribe("test.slow", Some(&slow_tag)).await.unwrap();
    release.notify_one();
    assert!(recv(&mut settled).await);

    // Acked by the cancelled consumer, so the remaining one never sees it
    assert_quiet(&mut sibling_rx).await;
    assert_eq!(broker.message_count("microwork-test.slow-queue").await, Some(0));
    assert_eq!(broker.consumer_count("microwork-test.slow-queue").await, Some(1));
    service.stop().await.unwrap();
}
