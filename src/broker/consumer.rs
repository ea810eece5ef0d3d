//! Unified consumer
//!
//! Receiving does not go through the pool: a subscription is a long-lived,
//! dedicated stream. Opening it shares the backend's connect pipeline, so a
//! broker that refuses connections trips one breaker for both directions.

use async_trait::async_trait;
use courier_core_resilience::{ResilienceError, ResiliencePipeline};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BrokerConsumer, MessageHandler};
use crate::error::{BrokerError, Result};
use crate::transport::{BackendKind, Subscribe};

/// Counters for one `consume` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub received: u64,
    pub handled: u64,
    pub rejected: u64,
}

pub struct UnifiedConsumer<T: Subscribe> {
    transport: Arc<T>,
    connect: ResiliencePipeline,
    default_source: String,
}

impl<T: Subscribe> UnifiedConsumer<T> {
    pub fn new(
        transport: Arc<T>,
        connect: ResiliencePipeline,
        default_source: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            connect,
            default_source: default_source.into(),
        }
    }

    pub fn default_source(&self) -> &str {
        &self.default_source
    }

    /// Deliver every message from `source` to `handler` until `cancel` fires
    /// or the broker ends the stream.
    ///
    /// Handled messages are acked, rejected ones nacked. A handler error never
    /// stops the loop; a transport error does.
    pub async fn consume(
        &self,
        source: &str,
        handler: MessageHandler,
        cancel: &CancellationToken,
    ) -> Result<ConsumeSummary> {
        let backend = self.transport.kind();
        let transport = &self.transport;
        let mut subscription = self
            .connect
            .execute(cancel, move || async move {
                transport
                    .subscribe(source)
                    .await
                    .map_err(ResilienceError::from)
            })
            .await
            .map_err(|e| BrokerError::from_acquire(backend, e))?;
        info!(%backend, source, "subscription opened");

        let mut summary = ConsumeSummary::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(%backend, source, "subscription cancelled");
                    break;
                }
                next = subscription.next() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    debug!(%backend, source, "subscription ended");
                    break;
                }
                Err(e) => return Err(BrokerError::transport(backend, e)),
            };
            summary.received += 1;

            match handler(delivery).await {
                Ok(()) => {
                    summary.handled += 1;
                    subscription
                        .ack()
                        .await
                        .map_err(|e| BrokerError::transport(backend, e))?;
                }
                Err(e) => {
                    summary.rejected += 1;
                    warn!(%backend, source, error = %e, "handler rejected message");
                    subscription
                        .nack()
                        .await
                        .map_err(|e| BrokerError::transport(backend, e))?;
                }
            }
        }

        info!(
            %backend,
            source,
            received = summary.received,
            rejected = summary.rejected,
            "subscription closed"
        );
        Ok(summary)
    }
}

#[async_trait]
impl<T: Subscribe> BrokerConsumer for UnifiedConsumer<T> {
    fn backend(&self) -> BackendKind {
        self.transport.kind()
    }

    async fn subscribe(
        &self,
        handler: MessageHandler,
        cancel: &CancellationToken,
    ) -> Result<ConsumeSummary> {
        if self.default_source.is_empty() {
            return Err(BrokerError::Config(format!(
                "[{}] no source configured to subscribe to",
                self.transport.kind()
            )));
        }
        self.consume(&self.default_source, handler, cancel).await
    }
}
