/*!
 * Courier - unified message publishing over heterogeneous brokers
 *
 * One producer/consumer contract in front of four broker families:
 * - AMQP 0-9-1 exchanges with persistent delivery and optional confirms
 * - PUB/SUB sockets with topic-prefixed frames
 * - Log brokers (topic + record key)
 * - MQTT topics with QoS and retain
 *
 * Every backend gets a bounded connection pool, a retry pipeline with a
 * circuit breaker for connecting and another for publishing, token-bucket
 * throttling and per-backend prometheus counters.
 *
 * Version: 0.1.0
 */

pub mod backends;
pub mod broker;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod registry;
pub mod testing;
pub mod transport;

// Re-export commonly used types
pub use broker::{
    BrokerConsumer, BrokerDiagnostics, BrokerProducer, BrokerProducerExt, ConsumeSummary,
    UnifiedConsumer, UnifiedPublisher,
};
pub use config::CourierConfig;
pub use error::{BrokerError, FailureKind, Result};
pub use message::{BrokerMetadata, Delivery, Destination, Envelope, MessageContext, PublishReceipt};
pub use registry::{BrokerRegistry, RegisteredBroker};
pub use transport::{BackendKind, Transport, TransportError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
