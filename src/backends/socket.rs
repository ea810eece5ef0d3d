//! PUB/SUB socket backend
//!
//! The pooled resource is a connected PUB socket. Each message goes out as
//! two frames, `[topic, payload]`, so subscribers can filter on the topic
//! prefix. Sockets have no header concept: headers and message ids never
//! reach the wire.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::SocketSettings;
use crate::message::Envelope;
use crate::transport::{BackendKind, Subscribe, Subscription, Transport, TransportError};

/// A connected PUB socket
#[async_trait]
pub trait PublisherSocket: Send + Sync {
    fn is_open(&self) -> bool;

    /// Send one multi-frame message
    async fn send_frames(&self, frames: Vec<Vec<u8>>) -> Result<(), TransportError>;

    fn close(&self) {}
}

#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    async fn open_publisher(&self, endpoint: &str)
        -> Result<Box<dyn PublisherSocket>, TransportError>;

    /// SUB socket filtered on `topic` (empty = everything)
    async fn open_subscriber(
        &self,
        endpoint: &str,
        topic: &str,
    ) -> Result<Box<dyn Subscription>, TransportError>;
}

pub struct SocketTransport {
    connector: Arc<dyn SocketConnector>,
    settings: SocketSettings,
}

impl SocketTransport {
    pub fn new(connector: Arc<dyn SocketConnector>, settings: SocketSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &SocketSettings {
        &self.settings
    }
}

/// Frames for one envelope
pub fn frames(envelope: &Envelope) -> Vec<Vec<u8>> {
    vec![
        envelope.destination.topic_name().as_bytes().to_vec(),
        envelope.payload.clone(),
    ]
}

#[async_trait]
impl Transport for SocketTransport {
    type Handle = Box<dyn PublisherSocket>;

    fn kind(&self) -> BackendKind {
        BackendKind::Socket
    }

    fn endpoint(&self) -> String {
        self.settings.endpoint.clone()
    }

    async fn connect(&self) -> Result<Self::Handle, TransportError> {
        self.connector.open_publisher(&self.settings.endpoint).await
    }

    fn is_usable(&self, handle: &Self::Handle) -> bool {
        handle.is_open()
    }

    async fn send(&self, handle: &Self::Handle, envelope: &Envelope) -> Result<(), TransportError> {
        handle.send_frames(frames(envelope)).await
    }

    fn close(&self, handle: Self::Handle) {
        handle.close();
    }

    fn forwards_headers(&self) -> bool {
        false
    }
}

#[async_trait]
impl Subscribe for SocketTransport {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError> {
        self.connector
            .open_subscriber(&self.settings.endpoint, topic)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Destination;
    use crate::testing::InMemoryBroker;

    #[test]
    fn test_frames_are_topic_then_payload() {
        let envelope = Envelope::raw(Destination::topic("ticks"), b"[1,2]".to_vec());
        assert_eq!(frames(&envelope), vec![b"ticks".to_vec(), b"[1,2]".to_vec()]);
    }

    #[tokio::test]
    async fn test_send_publishes_on_topic() {
        let broker = InMemoryBroker::new();
        let transport = SocketTransport::new(Arc::new(broker.clone()), SocketSettings::default());
        let handle = transport.connect().await.unwrap();

        let envelope = Envelope::raw(Destination::new("market", "ticks"), b"{}".to_vec());
        transport.send(&handle, &envelope).await.unwrap();

        let frames = broker.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].backend, BackendKind::Socket);
        assert_eq!(frames[0].topic, "ticks");
        assert!(frames[0].headers.is_empty());
        assert!(!transport.forwards_headers());
    }
}
