//! Composition of backend adapters
//!
//! [`BrokerRegistry`] is where a transport, its pool, both resilience
//! pipelines and its metric handles are wired together. Application code
//! looks adapters up by name and only ever sees the backend-independent
//! [`BrokerProducer`] and [`BrokerConsumer`] contracts.
//!
//! ```
//! use courier::config::AmqpSettings;
//! use courier::registry::BrokerRegistry;
//! use courier::testing::InMemoryBroker;
//! use courier_observability::MetricsRegistry;
//! use std::sync::Arc;
//!
//! let mut registry = BrokerRegistry::new(MetricsRegistry::new().unwrap());
//! registry
//!     .register_amqp("orders", AmqpSettings::default(), Arc::new(InMemoryBroker::new()))
//!     .unwrap();
//!
//! assert!(registry.producer("orders").is_ok());
//! assert_eq!(registry.names(), vec!["orders"]);
//! ```

use courier_core_resilience::{BackendPipelines, ConnectionPool, PoolStats};
use courier_observability::{BrokerMetrics, MetricsRegistry};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backends::{
    AmqpConnector, AmqpTransport, LogConnector, LogTransport, MqttConnector, MqttTransport,
    SocketConnector, SocketTransport,
};
use crate::broker::{
    BrokerConsumer, BrokerDiagnostics, BrokerProducer, PublisherOptions, UnifiedConsumer,
    UnifiedPublisher,
};
use crate::config::{
    AmqpSettings, CourierConfig, LogSettings, MqttSettings, PoolSettings, SocketSettings,
};
use crate::error::{BrokerError, Result};
use crate::message::Destination;
use crate::transport::{BackendKind, Subscribe, TransportConnector};

/// One fully wired adapter
#[derive(Clone)]
pub struct RegisteredBroker {
    name: String,
    kind: BackendKind,
    endpoint: String,
    producer: Arc<dyn BrokerProducer>,
    consumer: Arc<dyn BrokerConsumer>,
    diagnostics: Arc<dyn BrokerDiagnostics>,
    metrics: BrokerMetrics,
}

impl RegisteredBroker {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn producer(&self) -> Arc<dyn BrokerProducer> {
        Arc::clone(&self.producer)
    }

    pub fn consumer(&self) -> Arc<dyn BrokerConsumer> {
        Arc::clone(&self.consumer)
    }

    pub fn diagnostics(&self) -> Arc<dyn BrokerDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.diagnostics.pool_stats()
    }
}

impl fmt::Debug for RegisteredBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBroker")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("pool", &self.pool_stats())
            .finish()
    }
}

/// Named adapters sharing one metrics registry
///
/// Metrics are labelled by backend kind, so two adapters of the same kind
/// add to the same series.
pub struct BrokerRegistry {
    metrics: MetricsRegistry,
    brokers: BTreeMap<String, RegisteredBroker>,
}

impl BrokerRegistry {
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            metrics,
            brokers: BTreeMap::new(),
        }
    }

    /// Register one adapter per configured section, named after its backend
    /// (`amqp`, `socket`, `log`, `mqtt`), using the real client of each.
    ///
    /// A configured backend whose client feature was not compiled in is an
    /// [`BrokerError::Unsupported`] error.
    pub fn from_config(config: &CourierConfig, metrics: MetricsRegistry) -> Result<Self> {
        config.validate()?;
        let mut registry = Self::new(metrics);
        if let Some(settings) = &config.amqp {
            registry.connect_amqp(settings)?;
        }
        if let Some(settings) = &config.socket {
            registry.connect_socket(settings)?;
        }
        if let Some(settings) = &config.log {
            registry.connect_log(settings)?;
        }
        if let Some(settings) = &config.mqtt {
            registry.connect_mqtt(settings)?;
        }
        Ok(registry)
    }

    pub fn register_amqp(
        &mut self,
        name: &str,
        settings: AmqpSettings,
        connector: Arc<dyn AmqpConnector>,
    ) -> Result<&RegisteredBroker> {
        settings.validate()?;
        let pool = settings.pool.clone();
        let destination = settings.destination();
        let source = if settings.queue.is_empty() {
            settings.routing_key.clone()
        } else {
            settings.queue.clone()
        };
        let transport = AmqpTransport::new(connector, settings);
        self.register(name, transport, &pool, destination, source)
    }

    pub fn register_socket(
        &mut self,
        name: &str,
        settings: SocketSettings,
        connector: Arc<dyn SocketConnector>,
    ) -> Result<&RegisteredBroker> {
        settings.validate()?;
        let pool = settings.pool.clone();
        let destination = settings.destination();
        let source = settings.topic.clone();
        let transport = SocketTransport::new(connector, settings);
        self.register(name, transport, &pool, destination, source)
    }

    pub fn register_log(
        &mut self,
        name: &str,
        settings: LogSettings,
        connector: Arc<dyn LogConnector>,
    ) -> Result<&RegisteredBroker> {
        settings.validate()?;
        let pool = settings.pool.clone();
        let destination = settings.destination();
        let source = settings.topic.clone();
        let transport = LogTransport::new(connector, settings);
        self.register(name, transport, &pool, destination, source)
    }

    pub fn register_mqtt(
        &mut self,
        name: &str,
        settings: MqttSettings,
        connector: Arc<dyn MqttConnector>,
    ) -> Result<&RegisteredBroker> {
        settings.validate()?;
        let pool = settings.pool.clone();
        let destination = settings.destination();
        let source = settings.topic.clone();
        let transport = MqttTransport::new(connector, settings);
        self.register(name, transport, &pool, destination, source)
    }

    fn register<T: Subscribe>(
        &mut self,
        name: &str,
        transport: T,
        settings: &PoolSettings,
        default_destination: Destination,
        default_source: String,
    ) -> Result<&RegisteredBroker> {
        if self.brokers.contains_key(name) {
            return Err(BrokerError::Config(format!(
                "a broker named '{}' is already registered",
                name
            )));
        }

        let kind = transport.kind();
        let endpoint = transport.endpoint();
        let transport = Arc::new(transport);
        let metrics = self.metrics.adapter(kind.as_str(), name);
        let pipelines = BackendPipelines::uniform(kind.as_str(), settings.pipeline_config());

        let factory = Arc::new(TransportConnector::new(
            Arc::clone(&transport),
            settings.log_level,
        ));
        let pool = ConnectionPool::with_listener(
            factory,
            settings.pool_config(),
            pipelines.connect.clone(),
            Arc::new(metrics.clone()),
        );

        let options = PublisherOptions::from_settings(default_destination, settings);
        let mut publisher = UnifiedPublisher::new(
            Arc::clone(&transport),
            pool,
            pipelines.publish,
            metrics.clone(),
            options,
        );
        if let Some(limiter) = settings.rate_limiter()? {
            publisher = publisher.with_rate_limiter(limiter);
        }
        let publisher = Arc::new(publisher);
        let consumer = Arc::new(UnifiedConsumer::new(transport, pipelines.connect, default_source));

        info!(
            name,
            backend = %kind,
            endpoint = %endpoint,
            max_connections = settings.max_connections,
            "broker registered"
        );

        let broker = RegisteredBroker {
            name: name.to_string(),
            kind,
            endpoint,
            producer: Arc::clone(&publisher) as Arc<dyn BrokerProducer>,
            consumer,
            diagnostics: publisher,
            metrics,
        };
        Ok(self.brokers.entry(name.to_string()).or_insert(broker))
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredBroker> {
        self.brokers.get(name)
    }

    fn require(&self, name: &str) -> Result<&RegisteredBroker> {
        self.get(name)
            .ok_or_else(|| BrokerError::Config(format!("no broker named '{}' is registered", name)))
    }

    pub fn producer(&self, name: &str) -> Result<Arc<dyn BrokerProducer>> {
        self.require(name).map(RegisteredBroker::producer)
    }

    pub fn consumer(&self, name: &str) -> Result<Arc<dyn BrokerConsumer>> {
        self.require(name).map(RegisteredBroker::consumer)
    }

    pub fn diagnostics(&self, name: &str) -> Result<Arc<dyn BrokerDiagnostics>> {
        self.require(name).map(RegisteredBroker::diagnostics)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.brokers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Ping every registered broker, in name order
    pub async fn ping_all(&self, cancel: &CancellationToken) -> Vec<(String, Result<()>)> {
        let mut results = Vec::with_capacity(self.brokers.len());
        for (name, broker) in &self.brokers {
            results.push((name.clone(), broker.diagnostics.ping(cancel).await));
        }
        results
    }

    /// Shut down every pool. Leases still out are closed when returned.
    pub fn shutdown(&self) {
        for broker in self.brokers.values() {
            broker.diagnostics.shutdown();
        }
        info!(brokers = self.brokers.len(), "broker registry shut down");
    }

    #[cfg(feature = "amqp-lapin")]
    fn connect_amqp(&mut self, settings: &AmqpSettings) -> Result<()> {
        let connector = Arc::new(crate::backends::LapinConnector::new(settings));
        self.register_amqp(BackendKind::Amqp.as_str(), settings.clone(), connector)
            .map(|_| ())
    }

    #[cfg(not(feature = "amqp-lapin"))]
    fn connect_amqp(&mut self, _settings: &AmqpSettings) -> Result<()> {
        Err(missing_client(BackendKind::Amqp, "amqp-lapin"))
    }

    #[cfg(feature = "socket-zeromq")]
    fn connect_socket(&mut self, settings: &SocketSettings) -> Result<()> {
        let connector = Arc::new(crate::backends::ZmqConnector::new());
        self.register_socket(BackendKind::Socket.as_str(), settings.clone(), connector)
            .map(|_| ())
    }

    #[cfg(not(feature = "socket-zeromq"))]
    fn connect_socket(&mut self, _settings: &SocketSettings) -> Result<()> {
        Err(missing_client(BackendKind::Socket, "socket-zeromq"))
    }

    #[cfg(feature = "log-kafka")]
    fn connect_log(&mut self, settings: &LogSettings) -> Result<()> {
        let connector = Arc::new(crate::backends::KafkaConnector::new(settings));
        self.register_log(BackendKind::Log.as_str(), settings.clone(), connector)
            .map(|_| ())
    }

    #[cfg(not(feature = "log-kafka"))]
    fn connect_log(&mut self, _settings: &LogSettings) -> Result<()> {
        Err(missing_client(BackendKind::Log, "log-kafka"))
    }

    #[cfg(feature = "mqtt-rumqttc")]
    fn connect_mqtt(&mut self, settings: &MqttSettings) -> Result<()> {
        let connector = Arc::new(crate::backends::RumqttcConnector::new());
        self.register_mqtt(BackendKind::Mqtt.as_str(), settings.clone(), connector)
            .map(|_| ())
    }

    #[cfg(not(feature = "mqtt-rumqttc"))]
    fn connect_mqtt(&mut self, _settings: &MqttSettings) -> Result<()> {
        Err(missing_client(BackendKind::Mqtt, "mqtt-rumqttc"))
    }
}

#[allow(dead_code)]
fn missing_client(backend: BackendKind, feature: &str) -> BrokerError {
    BrokerError::Unsupported {
        backend,
        operation: format!("connecting (built without the `{}` feature)", feature),
    }
}

impl fmt::Debug for BrokerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerRegistry")
            .field("brokers", &self.brokers.values().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerProducerExt;
    use crate::error::FailureKind;
    use crate::message::BrokerMetadata;
    use crate::testing::InMemoryBroker;
    use serde_json::json;

    fn registry() -> BrokerRegistry {
        BrokerRegistry::new(MetricsRegistry::new().unwrap())
    }

    #[tokio::test]
    async fn test_registered_producer_publishes() {
        let broker = InMemoryBroker::new();
        let mut registry = registry();
        let settings = AmqpSettings {
            exchange: "events".into(),
            ..Default::default()
        };
        registry
            .register_amqp("orders", settings, Arc::new(broker.clone()))
            .unwrap();

        let producer = registry.producer("orders").unwrap();
        let receipt = producer
            .publish_message(
                &json!({"id": 7}),
                &BrokerMetadata::new("orders.created"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(receipt.backend, BackendKind::Amqp);
        assert_eq!(broker.frames().len(), 1);
        assert_eq!(registry.get("orders").unwrap().metrics().published(), 1);
    }

    #[tokio::test]
    async fn test_pool_gauges_are_kept_per_adapter() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = registry();
        for name in ["a", "b"] {
            let settings = LogSettings {
                topic: "audit".into(),
                ..Default::default()
            };
            registry.register_log(name, settings, broker.clone()).unwrap();
        }

        registry
            .producer("a")
            .unwrap()
            .publish_message(&json!({}), &BrokerMetadata::default(), &CancellationToken::new())
            .await
            .unwrap();

        let a = registry.get("a").unwrap();
        let b = registry.get("b").unwrap();
        assert_eq!(a.metrics().pool_idle(), 1);
        assert_eq!(b.metrics().pool_idle(), 0);
        assert_eq!(a.metrics().published(), 1);
        assert_eq!(b.metrics().published(), 1);

        let rendered = registry.metrics().render().unwrap();
        assert!(rendered.contains(r#"courier_pool_idle{backend="log",pool="a"} 1"#));
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = registry();
        registry
            .register_log("events", LogSettings::default(), broker.clone())
            .unwrap();

        let err = registry
            .register_mqtt("events", MqttSettings::default(), broker)
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Config);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_name_is_a_config_error() {
        let registry = registry();
        assert!(registry.is_empty());
        assert_eq!(
            registry.producer("missing").err().map(|e| e.kind()),
            Some(FailureKind::Config)
        );
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut settings = SocketSettings::default();
        settings.pool.max_connections = 0;

        let err = registry()
            .register_socket("ticks", settings, Arc::new(InMemoryBroker::new()))
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Config);
    }

    #[tokio::test]
    async fn test_ping_all_and_shutdown() {
        let broker = InMemoryBroker::new();
        let mut registry = registry();
        registry
            .register_socket("ticks", SocketSettings::default(), Arc::new(broker.clone()))
            .unwrap();
        registry
            .register_log("audit", LogSettings::default(), Arc::new(broker.clone()))
            .unwrap();

        let results = registry.ping_all(&CancellationToken::new()).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "audit");
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        registry.shutdown();
        assert_eq!(registry.get("ticks").unwrap().pool_stats().idle, 0);
        assert_eq!(broker.closed_handles(), 2);
    }

    #[cfg(not(feature = "amqp-lapin"))]
    #[test]
    fn test_from_config_without_client_feature() {
        let config = CourierConfig {
            amqp: Some(AmqpSettings::default()),
            ..Default::default()
        };
        let err = BrokerRegistry::from_config(&config, MetricsRegistry::new().unwrap()).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Unsupported);
        assert_eq!(err.backend(), Some(BackendKind::Amqp));
    }

    #[test]
    fn test_empty_config_builds_empty_registry() {
        let registry =
            BrokerRegistry::from_config(&CourierConfig::default(), MetricsRegistry::new().unwrap())
                .unwrap();
        assert!(registry.is_empty());
    }
}
