//! Log-oriented broker backend
//!
//! The exchange maps onto the log topic and the routing key onto the record
//! key (the "tag" brokers of this family filter on). Headers, correlation id
//! and message id travel as record headers.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LogSettings;
use crate::message::{Envelope, Headers};
use crate::transport::{BackendKind, Subscribe, Subscription, Transport, TransportError};

/// Record header carrying the correlation id
pub const CORRELATION_ID_HEADER: &str = "correlation_id";
/// Record header carrying the message id
pub const MESSAGE_ID_HEADER: &str = "message_id";

/// One record appended to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl LogRecord {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let destination = &envelope.destination;
        let topic = if destination.exchange.is_empty() {
            destination.routing_key.clone()
        } else {
            destination.exchange.clone()
        };

        let mut headers = envelope.headers.clone();
        if let Some(id) = &envelope.correlation_id {
            headers.insert(CORRELATION_ID_HEADER.to_string(), id.clone());
        }
        if let Some(id) = &envelope.message_id {
            headers.insert(MESSAGE_ID_HEADER.to_string(), id.clone());
        }

        Self {
            topic,
            key: destination.routing_key.clone(),
            payload: envelope.payload.clone(),
            headers,
        }
    }
}

/// A producer client
#[async_trait]
pub trait LogProducer: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Append one record, waiting at most `timeout` for the broker's ack
    async fn send(&self, record: &LogRecord, timeout: Duration) -> Result<(), TransportError>;

    fn close(&self) {}
}

#[async_trait]
pub trait LogConnector: Send + Sync + 'static {
    async fn create_producer(&self) -> Result<Box<dyn LogProducer>, TransportError>;

    async fn open_consumer(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError>;
}

pub struct LogTransport {
    connector: Arc<dyn LogConnector>,
    settings: LogSettings,
}

impl LogTransport {
    pub fn new(connector: Arc<dyn LogConnector>, settings: LogSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &LogSettings {
        &self.settings
    }
}

#[async_trait]
impl Transport for LogTransport {
    type Handle = Box<dyn LogProducer>;

    fn kind(&self) -> BackendKind {
        BackendKind::Log
    }

    fn endpoint(&self) -> String {
        self.settings.bootstrap_servers.clone()
    }

    async fn connect(&self) -> Result<Self::Handle, TransportError> {
        self.connector.create_producer().await
    }

    fn is_usable(&self, handle: &Self::Handle) -> bool {
        handle.is_ready()
    }

    async fn send(&self, handle: &Self::Handle, envelope: &Envelope) -> Result<(), TransportError> {
        handle
            .send(&LogRecord::from_envelope(envelope), self.settings.send_timeout())
            .await
    }

    fn close(&self, handle: Self::Handle) {
        handle.close();
    }
}

#[async_trait]
impl Subscribe for LogTransport {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError> {
        self.connector.open_consumer(topic).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Destination;
    use crate::testing::InMemoryBroker;

    #[test]
    fn test_record_mapping() {
        let envelope = Envelope::raw(Destination::new("audit", "login"), b"{}".to_vec())
            .with_correlation_id(Some("c-9".into()));
        let record = LogRecord::from_envelope(&envelope);

        assert_eq!(record.topic, "audit");
        assert_eq!(record.key, "login");
        assert_eq!(
            record.headers.get(CORRELATION_ID_HEADER).map(String::as_str),
            Some("c-9")
        );
        assert!(!record.headers.contains_key(MESSAGE_ID_HEADER));
    }

    #[test]
    fn test_topic_falls_back_to_routing_key() {
        let envelope = Envelope::raw(Destination::new("", "audit"), Vec::new());
        let record = LogRecord::from_envelope(&envelope);
        assert_eq!(record.topic, "audit");
        assert_eq!(record.key, "audit");
    }

    #[tokio::test]
    async fn test_send_appends_record() {
        let broker = InMemoryBroker::new();
        let transport = LogTransport::new(Arc::new(broker.clone()), LogSettings::default());
        let handle = transport.connect().await.unwrap();

        let envelope = Envelope::raw(Destination::topic("audit"), b"{\"id\":1}".to_vec());
        transport.send(&handle, &envelope).await.unwrap();

        let frames = broker.frames_for("audit");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].backend, BackendKind::Log);
        assert_eq!(frames[0].payload, b"{\"id\":1}");
    }
}
