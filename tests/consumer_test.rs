/*!
 * Integration tests for the unified consumer
 */

use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use courier::broker::{handler, json_handler, HandlerError};
use courier::config::{LogSettings, SocketSettings};
use courier::testing::InMemoryBroker;
use courier::{BrokerMetadata, BrokerProducerExt, BrokerRegistry, ConsumeSummary, FailureKind};
use courier_observability::MetricsRegistry;

#[derive(Debug, Deserialize)]
struct Login {
    user: String,
}

fn log_registry(broker: &InMemoryBroker) -> BrokerRegistry {
    let mut registry = BrokerRegistry::new(MetricsRegistry::new().unwrap());
    let settings = LogSettings {
        topic: "audit".into(),
        ..Default::default()
    };
    registry
        .register_log("log", settings, Arc::new(broker.clone()))
        .unwrap();
    registry
}

/// Inject until a subscriber is listening
async fn wait_for_subscriber(broker: &InMemoryBroker, source: &str, payload: &[u8]) {
    while broker.inject(source, payload) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_consumer_handles_and_rejects() {
    let broker = InMemoryBroker::new();
    let registry = log_registry(&broker);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let on_login = json_handler(move |login: Login, metadata: BrokerMetadata| {
        let sink = Arc::clone(&sink);
        async move {
            if login.user == "mallory" {
                return Err("blocked user".into());
            }
            sink.lock().unwrap().push((login.user, metadata.topic));
            Ok::<(), HandlerError>(())
        }
    });

    let consumer = registry.consumer("log").unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { consumer.subscribe(on_login, &cancel).await }
    });

    wait_for_subscriber(&broker, "audit", br#"{"user":"alice"}"#).await;
    let producer = registry.producer("log").unwrap();
    for user in ["bob", "mallory"] {
        producer
            .publish_message(&json!({ "user": user }), &BrokerMetadata::new("audit"), &cancel)
            .await
            .unwrap();
    }
    broker.inject("audit", b"not json");
    broker.close_subscriptions();

    let summary = task.await.unwrap().unwrap();
    assert_eq!(
        summary,
        ConsumeSummary {
            received: 4,
            handled: 2,
            rejected: 2
        }
    );
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("alice".to_string(), "audit".to_string()),
            ("bob".to_string(), "audit".to_string())
        ]
    );
    assert_eq!(broker.acks(), 2);
    assert_eq!(broker.nacks(), 2);
}

#[tokio::test]
async fn test_cancel_stops_the_consumer() {
    let broker = InMemoryBroker::new();
    let registry = log_registry(&broker);
    let consumer = registry.consumer("log").unwrap();
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            consumer
                .subscribe(handler(|_| async { Ok::<(), HandlerError>(()) }), &cancel)
                .await
        }
    });

    wait_for_subscriber(&broker, "audit", b"{}").await;
    cancel.cancel();

    let summary = task.await.unwrap().unwrap();
    assert!(summary.received <= 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_is_opened_through_the_connect_pipeline() {
    let broker = InMemoryBroker::new();
    let registry = log_registry(&broker);
    let consumer = registry.consumer("log").unwrap();
    broker.fail_next_connects(2);

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            consumer
                .subscribe(handler(|_| async { Ok::<(), HandlerError>(()) }), &cancel)
                .await
        }
    });

    wait_for_subscriber(&broker, "audit", b"{}").await;
    broker.close_subscriptions();

    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.handled, 1);
    assert_eq!(broker.connect_attempts(), 3);
}

#[tokio::test]
async fn test_refused_subscription_is_a_connect_failure() {
    let broker = InMemoryBroker::new();
    let mut registry = BrokerRegistry::new(MetricsRegistry::new().unwrap());
    let mut settings = LogSettings {
        topic: "audit".into(),
        ..Default::default()
    };
    settings.pool.retry_count = 1;
    registry
        .register_log("log", settings, Arc::new(broker.clone()))
        .unwrap();
    broker.fail_next_connects(1);

    let err = registry
        .consumer("log")
        .unwrap()
        .subscribe(handler(|_| async { Ok::<(), HandlerError>(()) }), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Connect);
}

#[tokio::test]
async fn test_subscribe_without_source_is_a_config_error() {
    let broker = InMemoryBroker::new();
    let mut registry = BrokerRegistry::new(MetricsRegistry::new().unwrap());
    registry
        .register_socket("socket", SocketSettings::default(), Arc::new(broker.clone()))
        .unwrap();

    let err = registry
        .consumer("socket")
        .unwrap()
        .subscribe(handler(|_| async { Ok::<(), HandlerError>(()) }), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Config);
    assert_eq!(broker.connect_attempts(), 0);
}
