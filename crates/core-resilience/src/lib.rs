//! Courier Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks the broker adapters use to stay
//! healthy when a backend misbehaves. It includes:
//!
//! - **Connection Pool**: Scoped leases over expensive, backend-specific handles
//! - **Circuit Breaker**: Fails fast while a backend is unhealthy, probes once after a cool-down
//! - **Retry Policy**: Bounded, cancellable back-off between attempts
//! - **Resilience Pipeline**: Retry loop around a breaker, one instance per {backend, operation}
//! - **Rate Limiter**: Token bucket throttling of outgoing messages
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Message brokers or their client libraries
//! - Serialization formats
//! - Metrics backends (lifecycle events go through [`PoolListener`])
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Broker Adapter                  │
//! └─────────────┬───────────────────────────┘
//!               │ acquire
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Pool                   │  ← Idle set, leases
//! │  (Health re-check on every release)     │
//! └─────────────┬───────────────────────────┘
//!               │ create (when no idle handle)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │   Resilience Pipeline: connect          │  ← Retry + breaker
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!          Broker client
//!
//!  Sending on a leased handle goes through a second,
//!  independent pipeline ("publish") with its own breaker.
//! ```
//!
//! # Usage Example
//!
//! ## Resilience Pipeline
//!
//! ```no_run
//! use courier_core_resilience::{
//!     CircuitBreakerConfig, OperationKind, PipelineConfig, ResilienceError, ResiliencePipeline,
//!     RetryPolicy,
//! };
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let config = PipelineConfig {
//!     retry: RetryPolicy::fixed(3, Duration::from_millis(500)),
//!     breaker: CircuitBreakerConfig {
//!         failure_threshold: 5,
//!         cooldown: Duration::from_secs(60),
//!     },
//! };
//! let publish = ResiliencePipeline::new("amqp", OperationKind::Publish, config);
//!
//! let cancel = CancellationToken::new();
//! let result = publish
//!     .execute(&cancel, || async {
//!         // Your potentially failing operation
//!         Ok::<_, ResilienceError>(42)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;

// Re-export main types for convenience
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use connection_pool::{
    ConnectionFactory, ConnectionPool, NoopListener, PoolConfig, PoolLease, PoolListener,
    PoolStats, SizePolicy,
};
pub use error::ResilienceError;
pub use pipeline::{BackendPipelines, OperationKind, PipelineConfig, ResiliencePipeline};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use courier_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::connection_pool::{
        ConnectionFactory, ConnectionPool, PoolConfig, PoolLease, PoolListener, SizePolicy,
    };
    pub use super::error::ResilienceError;
    pub use super::pipeline::{BackendPipelines, OperationKind, PipelineConfig, ResiliencePipeline};
    pub use super::rate_limiter::RateLimiter;
    pub use super::retry::RetryPolicy;
}
