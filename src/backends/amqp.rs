//! AMQP 0-9-1 backend
//!
//! The pooled resource is a channel. Channels are cheap compared to
//! connections, so real connectors multiplex every pooled channel over one
//! shared connection and reopen it when it drops.
//!
//! Messages are published persistent, with correlation/message ids and
//! headers as AMQP basic properties. With `publisher_confirms` every channel
//! is put in confirm mode and each send waits for the broker's ack for at
//! most `confirm_timeout_ms`.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::AmqpSettings;
use crate::message::{Envelope, Headers};
use crate::transport::{BackendKind, Subscribe, Subscription, Transport, TransportError};

/// `delivery_mode` of a message that survives a broker restart
pub const PERSISTENT: u8 = 2;

/// Basic properties sent with every message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpProperties {
    pub delivery_mode: u8,
    pub content_type: String,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub headers: Headers,
}

impl AmqpProperties {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            delivery_mode: PERSISTENT,
            content_type: envelope.content_type.clone(),
            correlation_id: envelope.correlation_id.clone(),
            message_id: envelope.message_id.clone(),
            headers: envelope.headers.clone(),
        }
    }
}

/// An open channel
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Put the channel in publisher-confirm mode
    async fn confirm_select(&self) -> Result<(), TransportError>;

    /// Publish one message; with `await_confirm` resolve only once the
    /// broker has acked it.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &AmqpProperties,
        body: &[u8],
        await_confirm: bool,
    ) -> Result<(), TransportError>;

    /// Start closing the channel. Must not block.
    fn close(&self) {}
}

/// Opens channels and queue consumers
#[async_trait]
pub trait AmqpConnector: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>, TransportError>;

    async fn open_consumer(&self, queue: &str) -> Result<Box<dyn Subscription>, TransportError>;
}

/// Pooled AMQP resource
pub struct AmqpHandle {
    channel: Box<dyn AmqpChannel>,
    confirms: bool,
}

impl AmqpHandle {
    pub fn channel(&self) -> &dyn AmqpChannel {
        self.channel.as_ref()
    }

    pub fn confirms(&self) -> bool {
        self.confirms
    }
}

pub struct AmqpTransport {
    connector: Arc<dyn AmqpConnector>,
    settings: AmqpSettings,
}

impl AmqpTransport {
    pub fn new(connector: Arc<dyn AmqpConnector>, settings: AmqpSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &AmqpSettings {
        &self.settings
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    type Handle = AmqpHandle;

    fn kind(&self) -> BackendKind {
        BackendKind::Amqp
    }

    fn endpoint(&self) -> String {
        self.settings.endpoint()
    }

    async fn connect(&self) -> Result<AmqpHandle, TransportError> {
        let channel = self.connector.open_channel().await?;
        if self.settings.publisher_confirms {
            if let Err(e) = channel.confirm_select().await {
                channel.close();
                return Err(e);
            }
        }
        Ok(AmqpHandle {
            channel,
            confirms: self.settings.publisher_confirms,
        })
    }

    fn is_usable(&self, handle: &AmqpHandle) -> bool {
        handle.channel.is_open()
    }

    async fn send(&self, handle: &AmqpHandle, envelope: &Envelope) -> Result<(), TransportError> {
        let properties = AmqpProperties::from_envelope(envelope);
        let publish = handle.channel.basic_publish(
            &envelope.destination.exchange,
            &envelope.destination.routing_key,
            &properties,
            &envelope.payload,
            handle.confirms,
        );

        if handle.confirms {
            let timeout = self.settings.confirm_timeout();
            tokio::time::timeout(timeout, publish)
                .await
                .map_err(|_| TransportError::Timeout(timeout))?
        } else {
            publish.await
        }
    }

    fn close(&self, handle: AmqpHandle) {
        handle.channel.close();
    }
}

#[async_trait]
impl Subscribe for AmqpTransport {
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, TransportError> {
        self.connector.open_consumer(queue).await
    }
}
