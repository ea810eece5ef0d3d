//! Courier Observability: metrics and spans for broker adapters
//!
//! This crate provides the diagnostics every broker adapter shares:
//! - **Prometheus metrics**: connections opened/closed and messages
//!   published/failed, one counter set per backend
//! - **Pool gauges**: idle and leased resources, fed by the connection pool's
//!   [`PoolListener`](courier_core_resilience::PoolListener) hook
//! - **Publish spans**: one `courier.publish` span per call with OpenTelemetry
//!   messaging attribute names
//!
//! ## Architecture
//!
//! Nothing in this crate is a process global. The application constructs a
//! [`MetricsRegistry`] once and hands it to the composition glue, which gives
//! each adapter a [`BrokerMetrics`] handle for its backend. Tests build their
//! own registry and install a [`testing::SpanRecorder`] to count spans.
//!
//! ## Prometheus Metrics
//!
//! ```
//! use courier_observability::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new().unwrap();
//! let log = registry.backend("log");
//! log.inc_connections_opened();
//! log.inc_failed();
//!
//! // Get metrics in Prometheus format
//! let metrics_text = registry.render().unwrap();
//! assert!(metrics_text.contains("courier_connections_opened_total"));
//! ```

pub mod metrics;
pub mod span;

// Testing utilities
pub mod testing;

pub use metrics::{BrokerMetrics, MetricsError, MetricsRegistry};
pub use span::{publish_span, PUBLISH_SPAN};
pub use testing::{RecordedSpan, SpanRecorder};

/// Prelude module for convenient imports
///
/// ```
/// use courier_observability::prelude::*;
/// ```
pub mod prelude {
    pub use crate::metrics::{BrokerMetrics, MetricsRegistry};
    pub use crate::span::publish_span;
    pub use crate::testing::SpanRecorder;
}
