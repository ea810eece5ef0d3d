/*!
 * Message model shared by every backend
 *
 * Application code works with typed messages; adapters work with an
 * [`Envelope`], the serialized form that is handed to a transport.
 */

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::transport::BackendKind;

/// Application headers, ordered by key
pub type Headers = BTreeMap<String, String>;

/// Content type of every payload produced by the publishers
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Where a message is published
///
/// AMQP addresses a message with an exchange and a routing key. The other
/// backends only know a single topic; [`Destination::topic`] fills both
/// dimensions with the same value for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Single-topic destination
    pub fn topic(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            exchange: topic.clone(),
            routing_key: topic,
        }
    }

    /// The one name a topic-only backend publishes to.
    ///
    /// The routing key is the more specific dimension, so it wins when both
    /// are set.
    pub fn topic_name(&self) -> &str {
        if self.routing_key.is_empty() {
            &self.exchange
        } else {
            &self.routing_key
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exchange.is_empty() && self.routing_key.is_empty()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.routing_key.is_empty() || self.exchange == self.routing_key {
            f.write_str(&self.exchange)
        } else if self.exchange.is_empty() {
            f.write_str(&self.routing_key)
        } else {
            write!(f, "{}/{}", self.exchange, self.routing_key)
        }
    }
}

/// Addressing and headers supplied alongside a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMetadata {
    /// Topic (or queue, on the receive side). Empty selects the adapter's
    /// configured default destination.
    pub topic: String,
    pub headers: Headers,
}

impl BrokerMetadata {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A typed message together with its transport metadata
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext<T> {
    pub payload: T,
    pub headers: Headers,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
}

impl<T> MessageContext<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            headers: Headers::new(),
            correlation_id: None,
            message_id: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Serialized message, ready for a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub destination: Destination,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub content_type: String,
}

impl Envelope {
    /// Serialize `message` as UTF-8 JSON
    pub fn json<M: Serialize + ?Sized>(
        destination: Destination,
        message: &M,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::raw(destination, serde_json::to_vec(message)?))
    }

    /// Wrap bytes that are already serialized
    pub fn raw(destination: Destination, payload: Vec<u8>) -> Self {
        Self {
            destination,
            payload,
            headers: Headers::new(),
            correlation_id: None,
            message_id: None,
            content_type: JSON_CONTENT_TYPE.to_string(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn with_message_id(mut self, id: Option<String>) -> Self {
        self.message_id = id;
        self
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// A message received from a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue or topic the message was received from
    pub source: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
}

impl Delivery {
    pub fn new(source: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            payload,
            headers: Headers::new(),
            correlation_id: None,
            message_id: None,
        }
    }

    /// Decode the payload as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Receive-side metadata: the source plus any headers the backend carried
    pub fn metadata(&self) -> BrokerMetadata {
        BrokerMetadata {
            topic: self.source.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// What a successful publish reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub backend: BackendKind,
    pub destination: Destination,
    /// Payload size in bytes
    pub size: usize,
    /// Whether headers reached the wire
    pub headers_forwarded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_fills_both_dimensions() {
        let dest = Destination::topic("orders");
        assert_eq!(dest.exchange, "orders");
        assert_eq!(dest.routing_key, "orders");
        assert_eq!(dest.topic_name(), "orders");
        assert_eq!(dest.to_string(), "orders");
    }

    #[test]
    fn test_topic_name_prefers_routing_key() {
        let dest = Destination::new("events", "orders.created");
        assert_eq!(dest.topic_name(), "orders.created");
        assert_eq!(dest.to_string(), "events/orders.created");

        let exchange_only = Destination::new("events", "");
        assert_eq!(exchange_only.topic_name(), "events");
        assert!(!exchange_only.is_empty());
        assert!(Destination::default().is_empty());
    }

    #[test]
    fn test_envelope_is_utf8_json() {
        let env = Envelope::json(Destination::topic("orders"), &json!({"id": 1})).unwrap();
        assert_eq!(env.payload, br#"{"id":1}"#);
        assert_eq!(env.content_type, JSON_CONTENT_TYPE);
        assert_eq!(env.size(), 8);
    }

    #[test]
    fn test_context_builders() {
        let ctx = MessageContext::new(5u32)
            .with_header("tenant", "acme")
            .with_correlation_id("c-1")
            .with_message_id("m-1");
        assert_eq!(ctx.headers.get("tenant").map(String::as_str), Some("acme"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(ctx.message_id.as_deref(), Some("m-1"));
    }

    #[test]
    fn test_delivery_decodes_json() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Order {
            id: u32,
        }

        let mut delivery = Delivery::new("orders", br#"{"id":7}"#.to_vec());
        delivery.headers.insert("tenant".into(), "acme".into());
        assert_eq!(delivery.json::<Order>().unwrap(), Order { id: 7 });

        let meta = delivery.metadata();
        assert_eq!(meta.topic, "orders");
        assert_eq!(meta.headers.len(), 1);
        assert!(delivery.json::<Vec<u8>>().is_err());
    }
}
