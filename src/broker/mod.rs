//! Backend-independent producer and consumer contracts
//!
//! Application code depends on [`BrokerProducer`] and [`BrokerConsumer`]
//! only; the concrete adapter behind them is chosen when the
//! [`BrokerRegistry`](crate::registry::BrokerRegistry) is composed.

mod consumer;
mod publisher;

pub use consumer::{ConsumeSummary, UnifiedConsumer};
pub use publisher::{PublisherOptions, UnifiedPublisher};

use async_trait::async_trait;
use courier_core_resilience::PoolStats;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{BrokerError, Result};
use crate::message::{BrokerMetadata, Delivery, PublishReceipt};
use crate::transport::BackendKind;

/// Error type a message handler may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receive callback; an `Err` rejects (nacks) the delivery
pub type MessageHandler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync>;

/// Publishing entry point that hides which backend is in use
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Publish `message` to `metadata.topic` (or the configured default
    /// destination when the topic is empty).
    ///
    /// Failures are returned, never panicked; each call is counted exactly
    /// once as published or failed.
    async fn publish(
        &self,
        message: &serde_json::Value,
        metadata: &BrokerMetadata,
        cancel: &CancellationToken,
    ) -> Result<PublishReceipt>;
}

/// Typed convenience over [`BrokerProducer`]
#[async_trait]
pub trait BrokerProducerExt: BrokerProducer {
    /// Convert `message` to JSON and publish it.
    ///
    /// A value that cannot be represented as JSON fails before the producer
    /// is called, so it is not counted by the producer's metrics.
    async fn publish_message<M: Serialize + Sync>(
        &self,
        message: &M,
        metadata: &BrokerMetadata,
        cancel: &CancellationToken,
    ) -> Result<PublishReceipt> {
        let value = serde_json::to_value(message)
            .map_err(|e| BrokerError::serialization(self.backend(), e))?;
        self.publish(&value, metadata, cancel).await
    }
}

impl<P: BrokerProducer + ?Sized> BrokerProducerExt for P {}

/// Receive-side counterpart of [`BrokerProducer`]
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Consume the configured source until `cancel` fires or the stream ends
    async fn subscribe(
        &self,
        handler: MessageHandler,
        cancel: &CancellationToken,
    ) -> Result<ConsumeSummary>;
}

/// Health and pool inspection of a registered adapter
#[async_trait]
pub trait BrokerDiagnostics: Send + Sync {
    /// Lease a connection and run the backend's ping on it
    async fn ping(&self, cancel: &CancellationToken) -> Result<()>;

    fn pool_stats(&self) -> PoolStats;

    /// Close idle connections and refuse further publishes
    fn shutdown(&self);
}

/// Build a [`MessageHandler`] from an async closure over raw deliveries
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |delivery| f(delivery).boxed())
}

/// Build a [`MessageHandler`] that decodes JSON payloads into `M`.
///
/// Payloads that do not decode are rejected without calling `f`.
pub fn json_handler<M, F, Fut>(f: F) -> MessageHandler
where
    M: DeserializeOwned + Send + 'static,
    F: Fn(M, BrokerMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |delivery: Delivery| match delivery.json::<M>() {
        Ok(message) => f(message, delivery.metadata()).boxed(),
        Err(e) => futures::future::ready(Err(Box::new(e) as HandlerError)).boxed(),
    })
}
