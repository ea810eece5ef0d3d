//! Broker backends
//!
//! Each backend module defines the native connector/handle traits of its
//! broker family and a [`Transport`](crate::transport::Transport) over them.
//! Real clients live behind cargo features, all off by default:
//!
//! | Backend | Module | Client feature |
//! |---|---|---|
//! | AMQP 0-9-1 | [`amqp`] | `amqp-lapin` |
//! | PUB/SUB socket | [`socket`] | `socket-zeromq` |
//! | Log broker | [`log`] | `log-kafka` |
//! | MQTT | [`mqtt`] | `mqtt-rumqttc` |
//!
//! Without any feature the backends can still be driven by
//! [`InMemoryBroker`](crate::testing::InMemoryBroker) or any other connector
//! implementation.

pub mod amqp;
pub mod log;
pub mod mqtt;
pub mod socket;

#[cfg(feature = "amqp-lapin")]
pub mod amqp_lapin;

#[cfg(feature = "socket-zeromq")]
pub mod socket_zeromq;

#[cfg(feature = "log-kafka")]
pub mod log_kafka;

#[cfg(feature = "mqtt-rumqttc")]
pub mod mqtt_rumqttc;

pub use amqp::{AmqpChannel, AmqpConnector, AmqpHandle, AmqpProperties, AmqpTransport};
pub use log::{LogConnector, LogProducer, LogRecord, LogTransport};
pub use mqtt::{MqttConnector, MqttPublish, MqttSession, MqttSessionOptions, MqttTransport};
pub use socket::{PublisherSocket, SocketConnector, SocketTransport};

#[cfg(feature = "amqp-lapin")]
pub use amqp_lapin::LapinConnector;

#[cfg(feature = "socket-zeromq")]
pub use socket_zeromq::ZmqConnector;

#[cfg(feature = "log-kafka")]
pub use log_kafka::KafkaConnector;

#[cfg(feature = "mqtt-rumqttc")]
pub use mqtt_rumqttc::RumqttcConnector;
