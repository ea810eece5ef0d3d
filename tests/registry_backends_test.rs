/*!
 * Integration tests for the broker registry across all four backends
 *
 * Adapters are registered from configuration files against the in-process
 * broker and used only through the backend-independent contracts.
 */

use serde_json::json;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use courier::backends::amqp::PERSISTENT;
use courier::config::{AmqpSettings, CourierConfig, HeaderPolicy, MqttSettings, SocketSettings};
use courier::testing::InMemoryBroker;
use courier::{BackendKind, BrokerMetadata, BrokerProducerExt, BrokerRegistry};
use courier_observability::testing::SpanRecorder;
use courier_observability::{MetricsRegistry, PUBLISH_SPAN};

const CONFIG: &str = r#"
[logging]
log_level = "debug"

[amqp]
host = "rabbit.internal"
exchange = "events"
routing_key = "orders.created"
queue = "orders"
max_connections = 2
retry_count = 2

[socket]
endpoint = "tcp://127.0.0.1:7000"
topic = "ticks"

[log]
bootstrap_servers = "kafka-1:9092"
topic = "audit"
tag = "login"

[mqtt]
host = "mqtt.internal"
topic = "sensors/42"
qos = 0
"#;

fn load_config() -> CourierConfig {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("courier.toml");
    fs::write(&path, CONFIG).unwrap();
    CourierConfig::from_file(&path).unwrap()
}

fn register_all(config: &CourierConfig, broker: &InMemoryBroker) -> BrokerRegistry {
    let connector = Arc::new(broker.clone());
    let mut registry = BrokerRegistry::new(MetricsRegistry::new().unwrap());
    registry
        .register_amqp("amqp", config.amqp.clone().unwrap(), connector.clone())
        .unwrap();
    registry
        .register_socket("socket", config.socket.clone().unwrap(), connector.clone())
        .unwrap();
    registry
        .register_log("log", config.log.clone().unwrap(), connector.clone())
        .unwrap();
    registry
        .register_mqtt("mqtt", config.mqtt.clone().unwrap(), connector)
        .unwrap();
    registry
}

#[tokio::test]
async fn test_every_backend_publishes_to_its_default_destination() {
    let config = load_config();
    let broker = InMemoryBroker::new();
    let registry = register_all(&config, &broker);
    let cancel = CancellationToken::new();

    for name in registry.names() {
        let producer = registry.producer(name).unwrap();
        let receipt = producer
            .publish_message(&json!({"id": 1}), &BrokerMetadata::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(receipt.backend.as_str(), name);
    }

    let frames = broker.frames();
    assert_eq!(frames.len(), 4);

    let amqp = frames.iter().find(|f| f.backend == BackendKind::Amqp).unwrap();
    assert_eq!(amqp.topic, "events");
    assert_eq!(amqp.key, "orders.created");
    assert_eq!(amqp.delivery_mode, Some(PERSISTENT));

    let socket = frames.iter().find(|f| f.backend == BackendKind::Socket).unwrap();
    assert_eq!(socket.topic, "ticks");

    let log = frames.iter().find(|f| f.backend == BackendKind::Log).unwrap();
    assert_eq!(log.topic, "audit");
    assert_eq!(log.key, "login");

    let mqtt = frames.iter().find(|f| f.backend == BackendKind::Mqtt).unwrap();
    assert_eq!(mqtt.topic, "sensors/42");
    assert_eq!(mqtt.qos, Some(0));

    for frame in &frames {
        assert_eq!(frame.payload, br#"{"id":1}"#.to_vec());
    }
}

#[tokio::test]
async fn test_single_topic_fills_both_address_dimensions() {
    let broker = InMemoryBroker::new();
    let mut registry = BrokerRegistry::new(MetricsRegistry::new().unwrap());
    registry
        .register_amqp("amqp", AmqpSettings::default(), Arc::new(broker.clone()))
        .unwrap();

    registry
        .producer("amqp")
        .unwrap()
        .publish_message(
            &json!({}),
            &BrokerMetadata::new("orders"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let frames = broker.frames();
    assert_eq!(frames[0].topic, "orders");
    assert_eq!(frames[0].key, "orders");
}

#[tokio::test]
async fn test_headers_reach_backends_that_support_them() {
    let config = load_config();
    let broker = InMemoryBroker::new();
    let registry = register_all(&config, &broker);
    let cancel = CancellationToken::new();
    let metadata = BrokerMetadata::default().with_header("tenant", "acme");

    let amqp = registry
        .producer("amqp")
        .unwrap()
        .publish_message(&json!({}), &metadata, &cancel)
        .await
        .unwrap();
    let log = registry
        .producer("log")
        .unwrap()
        .publish_message(&json!({}), &metadata, &cancel)
        .await
        .unwrap();
    let mqtt = registry
        .producer("mqtt")
        .unwrap()
        .publish_message(&json!({}), &metadata, &cancel)
        .await
        .unwrap();

    assert!(amqp.headers_forwarded);
    assert!(log.headers_forwarded);
    assert!(!mqtt.headers_forwarded);

    for frame in broker.frames() {
        let tenant = frame.headers.get("tenant").map(String::as_str);
        match frame.backend {
            BackendKind::Mqtt => assert_eq!(tenant, None),
            _ => assert_eq!(tenant, Some("acme")),
        }
    }
}

#[tokio::test]
async fn test_drop_policy_strips_headers() {
    let broker = InMemoryBroker::new();
    let mut settings = AmqpSettings::default();
    settings.pool.header_policy = HeaderPolicy::Drop;
    let mut registry = BrokerRegistry::new(MetricsRegistry::new().unwrap());
    registry
        .register_amqp("amqp", settings, Arc::new(broker.clone()))
        .unwrap();

    let receipt = registry
        .producer("amqp")
        .unwrap()
        .publish_message(
            &json!({}),
            &BrokerMetadata::new("orders").with_header("tenant", "acme"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!receipt.headers_forwarded);
    assert!(broker.frames()[0].headers.is_empty());
}

#[tokio::test]
async fn test_every_call_opens_and_closes_one_span() {
    let recorder = SpanRecorder::new();
    let _guard = tracing::subscriber::set_default(recorder.subscriber());

    let broker = InMemoryBroker::new();
    let mut registry = BrokerRegistry::new(MetricsRegistry::new().unwrap());
    registry
        .register_socket("socket", SocketSettings::default(), Arc::new(broker.clone()))
        .unwrap();
    let producer = registry.producer("socket").unwrap();
    let cancel = CancellationToken::new();

    producer
        .publish_message(&json!({"id": 1}), &BrokerMetadata::new("ticks"), &cancel)
        .await
        .unwrap();
    broker.reject_next_sends(1);
    producer
        .publish_message(&json!({"id": 2}), &BrokerMetadata::new("ticks"), &cancel)
        .await
        .unwrap_err();

    assert_eq!(recorder.opened(PUBLISH_SPAN), 2);
    assert_eq!(recorder.closed(PUBLISH_SPAN), 2);

    let spans = recorder.spans(PUBLISH_SPAN);
    assert_eq!(
        spans[0].fields.get("messaging.system").map(String::as_str),
        Some("socket")
    );
    assert_eq!(
        spans[0].fields.get("otel.status_code").map(String::as_str),
        Some("OK")
    );
    assert_eq!(
        spans[1].fields.get("otel.status_code").map(String::as_str),
        Some("ERROR")
    );
}

#[tokio::test]
async fn test_metrics_are_labelled_by_backend() {
    let broker = InMemoryBroker::new();
    let mut registry = BrokerRegistry::new(MetricsRegistry::new().unwrap());
    registry
        .register_mqtt("mqtt", MqttSettings::default(), Arc::new(broker.clone()))
        .unwrap();
    let cancel = CancellationToken::new();
    let producer = registry.producer("mqtt").unwrap();

    producer
        .publish_message(&json!({}), &BrokerMetadata::new("plant/1"), &cancel)
        .await
        .unwrap();
    broker.reject_next_sends(1);
    producer
        .publish_message(&json!({}), &BrokerMetadata::new("plant/1"), &cancel)
        .await
        .unwrap_err();

    let mqtt = registry.get("mqtt").unwrap().metrics();
    assert_eq!(mqtt.published(), 1);
    assert_eq!(mqtt.failed(), 1);
    assert_eq!(mqtt.connections_opened(), 1);

    let rendered = registry.metrics().render().unwrap();
    assert!(rendered.contains(r#"courier_messages_published_total{backend="mqtt"} 1"#));
    assert!(rendered.contains(r#"courier_messages_failed_total{backend="mqtt"} 1"#));
}

#[tokio::test]
async fn test_mqtt_sessions_use_distinct_client_ids() {
    let broker = InMemoryBroker::new();
    broker.set_send_delay(std::time::Duration::from_millis(5));
    let settings = MqttSettings {
        client_id: "gateway".into(),
        ..Default::default()
    };
    let mut registry = BrokerRegistry::new(MetricsRegistry::new().unwrap());
    registry
        .register_mqtt("mqtt", settings, Arc::new(broker.clone()))
        .unwrap();
    let producer = registry.producer("mqtt").unwrap();
    let cancel = CancellationToken::new();
    let metadata = BrokerMetadata::new("plant/1");
    let (first, second) = (json!({"n": 1}), json!({"n": 2}));

    let (a, b) = tokio::join!(
        producer.publish_message(&first, &metadata, &cancel),
        producer.publish_message(&second, &metadata, &cancel),
    );
    a.unwrap();
    b.unwrap();

    let ids = broker.client_ids();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    assert!(ids.iter().all(|id| id.starts_with("gateway-")));
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_ping_each_backend() {
    let config = load_config();
    let broker = InMemoryBroker::new();
    let registry = register_all(&config, &broker);

    let results = registry.ping_all(&CancellationToken::new()).await;
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|(_, result)| result.is_ok()));

    broker.fail_next_connects(10);
    broker.break_connections();
    let ping = registry
        .diagnostics("log")
        .unwrap()
        .ping(&CancellationToken::new())
        .await;
    assert!(ping.is_err());
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = load_config();
    assert_eq!(
        config.configured_backends(),
        vec![
            BackendKind::Amqp,
            BackendKind::Socket,
            BackendKind::Log,
            BackendKind::Mqtt
        ]
    );
    let amqp = config.amqp.as_ref().unwrap();
    assert_eq!(amqp.pool.max_connections, 2);
    assert_eq!(amqp.host, "rabbit.internal");

    let rendered = config.to_toml_string().unwrap();
    let reparsed = CourierConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}

#[test]
fn test_invalid_config_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("courier.toml");
    fs::write(&path, "[socket]\nmax_connections = 0\n").unwrap();

    assert!(CourierConfig::from_file(&path).is_err());
    assert!(CourierConfig::from_file(&dir.path().join("missing.toml")).is_err());
}
