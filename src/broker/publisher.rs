//! Unified publisher
//!
//! The publish algorithm is written once here and shared by every backend:
//!
//! 1. open the `courier.publish` span
//! 2. wait for the rate limiter, if one is configured
//! 3. lease a handle from the pool (connect pipeline)
//! 4. serialize, apply the header policy
//! 5. send through the publish pipeline, honouring cancellation
//! 6. count exactly one of published/failed and close the span
//!
//! The lease is returned on every path: explicitly after the send, and by
//! its `Drop` when an earlier step bails out or the caller's future is
//! dropped.

use async_trait::async_trait;
use courier_core_resilience::{
    ConnectionPool, PoolStats, RateLimiter, ResilienceError, ResiliencePipeline,
};
use courier_observability::span::{publish_span, record_failure, record_success};
use courier_observability::BrokerMetrics;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument, Span};

use super::{BrokerDiagnostics, BrokerProducer};
use crate::config::{HeaderPolicy, PoolSettings};
use crate::error::{BrokerError, Result};
use crate::message::{BrokerMetadata, Destination, Envelope, MessageContext, PublishReceipt};
use crate::transport::{BackendKind, Transport};

/// Counts a publish call as failed when its future is dropped before an
/// outcome was recorded.
struct PendingOutcome<'a> {
    metrics: &'a BrokerMetrics,
    span: &'a Span,
    armed: bool,
}

impl PendingOutcome<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingOutcome<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.metrics.inc_failed();
            record_failure(self.span, &"cancelled");
        }
    }
}

/// Per-adapter publish behaviour
#[derive(Debug, Clone, Default)]
pub struct PublisherOptions {
    /// Used when a call does not name a destination
    pub default_destination: Destination,
    pub header_policy: HeaderPolicy,
    /// Payloads above this size are logged as a warning
    pub max_message_size: Option<usize>,
}

impl PublisherOptions {
    pub fn from_settings(default_destination: Destination, settings: &PoolSettings) -> Self {
        Self {
            default_destination,
            header_policy: settings.header_policy,
            max_message_size: settings.max_message_size(),
        }
    }
}

/// Publishes through one backend with pooling, retries and metrics
pub struct UnifiedPublisher<T: Transport> {
    transport: Arc<T>,
    pool: ConnectionPool<T::Handle>,
    publish: ResiliencePipeline,
    metrics: BrokerMetrics,
    options: PublisherOptions,
    limiter: Option<RateLimiter>,
}

impl<T: Transport> UnifiedPublisher<T> {
    /// `publish` must be a pipeline of kind
    /// [`OperationKind::Publish`](courier_core_resilience::OperationKind),
    /// independent of the pool's connect pipeline.
    pub fn new(
        transport: Arc<T>,
        pool: ConnectionPool<T::Handle>,
        publish: ResiliencePipeline,
        metrics: BrokerMetrics,
        options: PublisherOptions,
    ) -> Self {
        Self {
            transport,
            pool,
            publish,
            metrics,
            options,
            limiter: None,
        }
    }

    /// Throttle publishes through a token bucket
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.transport.kind()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn pool(&self) -> &ConnectionPool<T::Handle> {
        &self.pool
    }

    pub fn publish_pipeline(&self) -> &ResiliencePipeline {
        &self.publish
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.options
    }

    /// Serialize `message` as JSON and publish it
    pub async fn publish<M: Serialize + ?Sized>(
        &self,
        destination: &Destination,
        message: &M,
        cancel: &CancellationToken,
    ) -> Result<PublishReceipt> {
        let backend = self.kind();
        let destination = self.resolve(destination);
        let target = destination.clone();
        self.run(&destination, cancel, move || {
            Envelope::json(target, message).map_err(|e| BrokerError::serialization(backend, e))
        })
        .await
    }

    /// Publish a message with headers and correlation/message ids.
    ///
    /// Headers reach the wire unless the header policy is `drop` or the
    /// backend has no header concept.
    pub async fn publish_context<M: Serialize>(
        &self,
        destination: &Destination,
        context: &MessageContext<M>,
        cancel: &CancellationToken,
    ) -> Result<PublishReceipt> {
        let backend = self.kind();
        let destination = self.resolve(destination);
        let target = destination.clone();
        self.run(&destination, cancel, move || {
            let envelope = Envelope::json(target, &context.payload)
                .map_err(|e| BrokerError::serialization(backend, e))?;
            Ok(envelope
                .with_headers(context.headers.clone())
                .with_correlation_id(context.correlation_id.clone())
                .with_message_id(context.message_id.clone()))
        })
        .await
    }

    /// Publish an already serialized envelope
    pub async fn publish_envelope(
        &self,
        mut envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<PublishReceipt> {
        envelope.destination = self.resolve(&envelope.destination);
        let destination = envelope.destination.clone();
        self.run(&destination, cancel, move || Ok(envelope)).await
    }

    /// Lease a handle and ping the broker on it. Not counted as a publish.
    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        let backend = self.kind();
        let lease = self
            .pool
            .acquire(cancel)
            .await
            .map_err(|e| BrokerError::from_acquire(backend, e))?;

        let probe = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BrokerError::Cancelled { backend }),
            result = self.transport.ping(&lease) => {
                result.map_err(|e| BrokerError::transport(backend, e))
            }
        };
        lease.release();
        probe
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn resolve(&self, destination: &Destination) -> Destination {
        if destination.is_empty() {
            self.options.default_destination.clone()
        } else {
            destination.clone()
        }
    }

    async fn run<F>(
        &self,
        destination: &Destination,
        cancel: &CancellationToken,
        encode: F,
    ) -> Result<PublishReceipt>
    where
        F: FnOnce() -> Result<Envelope>,
    {
        let backend = self.kind();
        let span = publish_span(backend.as_str(), &destination.to_string());
        let pending = PendingOutcome {
            metrics: &self.metrics,
            span: &span,
            armed: true,
        };
        let outcome = self.attempt(cancel, encode).instrument(span.clone()).await;
        pending.disarm();

        match &outcome {
            Ok(receipt) => {
                self.metrics.inc_published();
                record_success(&span, receipt.size);
            }
            Err(e) => {
                self.metrics.inc_failed();
                record_failure(&span, e);
                if e.is_cancelled() {
                    debug!(parent: &span, %backend, %destination, "publish cancelled");
                } else {
                    warn!(parent: &span, %backend, %destination, error = %e, "publish failed");
                }
            }
        }
        outcome
    }

    async fn attempt<F>(&self, cancel: &CancellationToken, encode: F) -> Result<PublishReceipt>
    where
        F: FnOnce() -> Result<Envelope>,
    {
        let backend = self.kind();

        if let Some(limiter) = &self.limiter {
            limiter
                .until_ready(cancel)
                .await
                .map_err(|e| BrokerError::from_publish(backend, e))?;
        }

        let lease = self
            .pool
            .acquire(cancel)
            .await
            .map_err(|e| BrokerError::from_acquire(backend, e))?;

        let envelope = self.prepare(encode()?);
        let headers_forwarded = !envelope.headers.is_empty();

        let handle: &T::Handle = &lease;
        let transport = &self.transport;
        let outgoing = &envelope;
        let sent = self
            .publish
            .execute(cancel, move || async move {
                transport
                    .send(handle, outgoing)
                    .await
                    .map_err(ResilienceError::from)
            })
            .await;
        lease.release();
        sent.map_err(|e| BrokerError::from_publish(backend, e))?;

        Ok(PublishReceipt {
            backend,
            size: envelope.size(),
            destination: envelope.destination,
            headers_forwarded,
        })
    }

    /// Apply the header policy and the size warning
    fn prepare(&self, mut envelope: Envelope) -> Envelope {
        if !envelope.headers.is_empty() {
            if self.options.header_policy == HeaderPolicy::Drop {
                envelope.headers.clear();
            } else if !self.transport.forwards_headers() {
                debug!(
                    backend = %self.kind(),
                    count = envelope.headers.len(),
                    "backend has no header support, headers dropped"
                );
                envelope.headers.clear();
            }
        }

        if let Some(max) = self.options.max_message_size {
            if envelope.size() > max {
                warn!(
                    backend = %self.kind(),
                    size = envelope.size(),
                    max,
                    "message exceeds the configured maximum size"
                );
            }
        }
        envelope
    }
}

impl<T: Transport> fmt::Debug for UnifiedPublisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnifiedPublisher")
            .field("backend", &self.kind())
            .field("endpoint", &self.transport.endpoint())
            .field("pool", &self.pool.stats())
            .field("options", &self.options)
            .finish()
    }
}

#[async_trait]
impl<T: Transport> BrokerProducer for UnifiedPublisher<T> {
    fn backend(&self) -> BackendKind {
        self.kind()
    }

    async fn publish(
        &self,
        message: &serde_json::Value,
        metadata: &BrokerMetadata,
        cancel: &CancellationToken,
    ) -> Result<PublishReceipt> {
        let backend = self.kind();
        let destination = self.resolve(&Destination::topic(metadata.topic.clone()));
        let target = destination.clone();
        self.run(&destination, cancel, move || {
            let envelope =
                Envelope::json(target, message).map_err(|e| BrokerError::serialization(backend, e))?;
            Ok(envelope.with_headers(metadata.headers.clone()))
        })
        .await
    }
}

#[async_trait]
impl<T: Transport> BrokerDiagnostics for UnifiedPublisher<T> {
    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.health_check(cancel).await
    }

    fn pool_stats(&self) -> PoolStats {
        self.stats()
    }

    fn shutdown(&self) {
        self.pool.shutdown();
    }
}
