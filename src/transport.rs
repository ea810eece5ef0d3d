/*!
 * Transport abstraction
 *
 * A [`Transport`] knows how to open, probe, use and close the native handle
 * of one broker technology. Everything else (pooling, retries, circuit
 * breaking, metrics, spans) is written once in [`crate::broker`] against
 * this trait.
 */

use async_trait::async_trait;
use courier_core_resilience::{ConnectionFactory, ResilienceError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::LogLevel;
use crate::logging::log_at;
use crate::message::{Delivery, Envelope};

/// The broker technologies courier can publish to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// AMQP 0-9-1 broker (exchange + routing key)
    Amqp,
    /// Lightweight PUB/SUB socket broker
    Socket,
    /// Log-oriented broker (topic + record key)
    Log,
    /// MQTT broker
    Mqtt,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Amqp,
        BackendKind::Socket,
        BackendKind::Log,
        BackendKind::Mqtt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Amqp => "amqp",
            BackendKind::Socket => "socket",
            BackendKind::Log => "log",
            BackendKind::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown backend '{}'", s))
    }
}

/// Failure reported by a broker client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("send failed: {0}")]
    Send(String),

    /// The broker refused the message (negative confirm, unknown exchange)
    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The handle is no longer usable. Retrying on the same lease cannot help.
    #[error("handle is closed")]
    Closed,

    #[error("not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_) | TransportError::Send(_) | TransportError::Timeout(_)
        )
    }
}

impl From<TransportError> for ResilienceError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(after) => ResilienceError::Timeout(after),
            e if e.is_transient() => ResilienceError::Transient(e.to_string()),
            e => ResilienceError::Permanent(e.to_string()),
        }
    }
}

/// Backend-specific connect/send primitives
///
/// `Handle` is the pooled resource: an AMQP channel, a PUB socket, a log
/// producer or an MQTT session. A handle is only ever used by one caller at
/// a time, so implementations need no internal locking for exclusivity.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    fn kind(&self) -> BackendKind;

    /// Endpoint description for logs (never contains credentials)
    fn endpoint(&self) -> String;

    /// Open a new handle
    async fn connect(&self) -> Result<Self::Handle, TransportError>;

    /// Health predicate. Must not block.
    fn is_usable(&self, handle: &Self::Handle) -> bool;

    /// Transmit one message on a leased handle
    async fn send(&self, handle: &Self::Handle, envelope: &Envelope) -> Result<(), TransportError>;

    /// Dispose of a handle leaving the pool. Must not block.
    fn close(&self, handle: Self::Handle) {
        drop(handle);
    }

    /// Diagnostics probe on a leased handle
    async fn ping(&self, handle: &Self::Handle) -> Result<(), TransportError> {
        if self.is_usable(handle) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Whether application headers can be carried on the wire
    fn forwards_headers(&self) -> bool {
        true
    }
}

/// A live receive stream
///
/// `ack` and `nack` settle the delivery most recently returned by `next`.
#[async_trait]
pub trait Subscription: Send {
    /// Next message, or `None` once the stream has ended
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn nack(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Receive-side extension of a transport
#[async_trait]
pub trait Subscribe: Transport {
    /// Open a dedicated subscription on `source` (queue or topic)
    async fn subscribe(&self, source: &str) -> Result<Box<dyn Subscription>, TransportError>;
}

/// Adapts a [`Transport`] to the pool's [`ConnectionFactory`]
///
/// Connection open/close events are logged at the backend's configured level.
pub struct TransportConnector<T: Transport> {
    transport: Arc<T>,
    log_level: LogLevel,
}

impl<T: Transport> TransportConnector<T> {
    pub fn new(transport: Arc<T>, log_level: LogLevel) -> Self {
        Self {
            transport,
            log_level,
        }
    }
}

#[async_trait]
impl<T: Transport> ConnectionFactory<T::Handle> for TransportConnector<T> {
    async fn create(&self) -> Result<T::Handle, ResilienceError> {
        let handle = self.transport.connect().await?;
        log_at(
            self.log_level,
            self.transport.kind(),
            &self.transport.endpoint(),
            "connection opened",
        );
        Ok(handle)
    }

    fn is_healthy(&self, handle: &T::Handle) -> bool {
        self.transport.is_usable(handle)
    }

    fn close(&self, handle: T::Handle) {
        self.transport.close(handle);
        log_at(
            self.log_level,
            self.transport.kind(),
            &self.transport.endpoint(),
            "connection closed",
        );
    }
}
