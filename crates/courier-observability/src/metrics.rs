//! Prometheus metrics for broker adapters
//!
//! Every backend gets the same counter set, distinguished by the `backend`
//! label. Pool gauges also carry a `pool` label, since two adapters of one
//! kind each own a pool and a gauge is overwritten, not summed. A [`MetricsRegistry`] owns its own prometheus registry, so several
//! can coexist in one process (one per test, for example).

use courier_core_resilience::PoolListener;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors raised while building or exporting metrics
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("metrics output is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Connections opened, per backend
pub const CONNECTIONS_OPENED: &str = "courier_connections_opened_total";
/// Connections closed, per backend
pub const CONNECTIONS_CLOSED: &str = "courier_connections_closed_total";
/// Messages accepted by the broker, per backend
pub const MESSAGES_PUBLISHED: &str = "courier_messages_published_total";
/// Publish calls that returned a failure, per backend
pub const MESSAGES_FAILED: &str = "courier_messages_failed_total";
/// Idle pooled resources, per backend and pool
pub const POOL_IDLE: &str = "courier_pool_idle";
/// Leased pooled resources, per backend and pool
pub const POOL_LEASED: &str = "courier_pool_leased";

/// Constructed-once registry passed by reference into each adapter
///
/// ## Example
///
/// ```
/// use courier_observability::MetricsRegistry;
///
/// let registry = MetricsRegistry::new().unwrap();
/// let amqp = registry.backend("amqp");
/// amqp.inc_published();
///
/// assert_eq!(amqp.published(), 1);
/// assert!(registry.render().unwrap().contains("courier_messages_published_total"));
/// ```
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    connections_opened: IntCounterVec,
    connections_closed: IntCounterVec,
    messages_published: IntCounterVec,
    messages_failed: IntCounterVec,
    pool_idle: IntGaugeVec,
    pool_leased: IntGaugeVec,
}

impl MetricsRegistry {
    /// Build a registry with every courier metric registered
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let connections_opened = counter(&registry, CONNECTIONS_OPENED, "Broker connections opened")?;
        let connections_closed = counter(&registry, CONNECTIONS_CLOSED, "Broker connections closed")?;
        let messages_published = counter(
            &registry,
            MESSAGES_PUBLISHED,
            "Messages successfully published",
        )?;
        let messages_failed = counter(&registry, MESSAGES_FAILED, "Publish calls that failed")?;
        let pool_idle = gauge(&registry, POOL_IDLE, "Idle resources in the connection pool")?;
        let pool_leased = gauge(&registry, POOL_LEASED, "Leased resources in the connection pool")?;

        Ok(Self {
            registry,
            connections_opened,
            connections_closed,
            messages_published,
            messages_failed,
            pool_idle,
            pool_leased,
        })
    }

    /// Counter handles for one backend, its pool gauges labelled with the
    /// backend name
    pub fn backend(&self, backend: &str) -> BrokerMetrics {
        self.adapter(backend, backend)
    }

    /// Handles for one named adapter.
    ///
    /// Counters are shared by every adapter of `backend`; the pool gauges
    /// belong to `pool` alone.
    pub fn adapter(&self, backend: &str, pool: &str) -> BrokerMetrics {
        let labels = [backend];
        let pool_labels = [backend, pool];
        BrokerMetrics {
            backend: backend.to_string(),
            connections_opened: self.connections_opened.with_label_values(&labels),
            connections_closed: self.connections_closed.with_label_values(&labels),
            messages_published: self.messages_published.with_label_values(&labels),
            messages_failed: self.messages_failed.with_label_values(&labels),
            pool_idle: self.pool_idle.with_label_values(&pool_labels),
            pool_leased: self.pool_leased.with_label_values(&pool_labels),
        }
    }

    /// The underlying prometheus registry, for exporters
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get metrics in Prometheus text format
    pub fn render(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec, MetricsError> {
    let vec = IntCounterVec::new(Opts::new(name, help), &["backend"])?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGaugeVec, MetricsError> {
    let vec = IntGaugeVec::new(Opts::new(name, help), &["backend", "pool"])?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

/// The counter set of one backend
///
/// Cheap to clone; clones update the same series.
#[derive(Clone)]
pub struct BrokerMetrics {
    backend: String,
    connections_opened: IntCounter,
    connections_closed: IntCounter,
    messages_published: IntCounter,
    messages_failed: IntCounter,
    pool_idle: IntGauge,
    pool_leased: IntGauge,
}

impl BrokerMetrics {
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn inc_connections_opened(&self) {
        self.connections_opened.inc();
    }

    pub fn inc_connections_closed(&self) {
        self.connections_closed.inc();
    }

    pub fn inc_published(&self) {
        self.messages_published.inc();
    }

    pub fn inc_failed(&self) {
        self.messages_failed.inc();
    }

    pub fn set_pool_sizes(&self, idle: usize, leased: usize) {
        self.pool_idle.set(idle as i64);
        self.pool_leased.set(leased as i64);
    }

    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.get()
    }

    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.get()
    }

    pub fn published(&self) -> u64 {
        self.messages_published.get()
    }

    pub fn failed(&self) -> u64 {
        self.messages_failed.get()
    }

    pub fn pool_idle(&self) -> i64 {
        self.pool_idle.get()
    }

    pub fn pool_leased(&self) -> i64 {
        self.pool_leased.get()
    }
}

impl std::fmt::Debug for BrokerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerMetrics")
            .field("backend", &self.backend)
            .field("published", &self.published())
            .field("failed", &self.failed())
            .finish()
    }
}

impl PoolListener for BrokerMetrics {
    fn on_opened(&self) {
        self.inc_connections_opened();
    }

    fn on_closed(&self) {
        self.inc_connections_closed();
    }

    fn on_idle_changed(&self, idle: usize, leased: usize) {
        self.set_pool_sizes(idle, leased);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backends_are_isolated_by_label() {
        let registry = MetricsRegistry::new().unwrap();
        let amqp = registry.backend("amqp");
        let mqtt = registry.backend("mqtt");

        amqp.inc_published();
        amqp.inc_published();
        mqtt.inc_failed();

        assert_eq!(amqp.published(), 2);
        assert_eq!(amqp.failed(), 0);
        assert_eq!(mqtt.published(), 0);
        assert_eq!(mqtt.failed(), 1);
    }

    #[test]
    fn test_handles_for_same_backend_share_series() {
        let registry = MetricsRegistry::new().unwrap();
        registry.backend("log").inc_connections_opened();
        registry.backend("log").inc_connections_opened();

        assert_eq!(registry.backend("log").connections_opened(), 2);
    }

    #[test]
    fn test_registries_are_independent() {
        let first = MetricsRegistry::new().unwrap();
        let second = MetricsRegistry::new().unwrap();

        first.backend("socket").inc_published();

        assert_eq!(second.backend("socket").published(), 0);
    }

    #[test]
    fn test_pool_listener_updates_gauges() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.backend("amqp");
        let listener: &dyn PoolListener = &metrics;

        listener.on_opened();
        listener.on_idle_changed(3, 2);
        listener.on_closed();

        assert_eq!(metrics.connections_opened(), 1);
        assert_eq!(metrics.connections_closed(), 1);
        assert_eq!(metrics.pool_idle(), 3);
        assert_eq!(metrics.pool_leased(), 2);
    }

    #[test]
    fn test_pool_gauges_are_per_adapter() {
        let registry = MetricsRegistry::new().unwrap();
        let a = registry.adapter("log", "a");
        let b = registry.adapter("log", "b");

        a.set_pool_sizes(1, 0);
        b.set_pool_sizes(0, 0);
        a.inc_published();
        b.inc_published();

        assert_eq!(a.pool_idle(), 1);
        assert_eq!(b.pool_idle(), 0);
        assert_eq!(a.published(), 2);

        let output = registry.render().unwrap();
        assert!(output.contains(r#"courier_pool_idle{backend="log",pool="a"} 1"#));
        assert!(output.contains(r#"courier_pool_idle{backend="log",pool="b"} 0"#));
    }

    #[test]
    fn test_render_text_format() {
        let registry = MetricsRegistry::new().unwrap();
        registry.backend("mqtt").inc_failed();

        let output = registry.render().unwrap();
        assert!(output.contains("# HELP courier_messages_failed_total"));
        assert!(output.contains("courier_messages_failed_total{backend=\"mqtt\"} 1"));
    }
}
